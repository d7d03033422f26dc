//! Small end-to-end demo: targeted damage with a god-mode interceptor and a
//! post-processing combat log.
//!
//! Run with: cargo run -p the-bus --example combat_log

use std::{
  cell::Cell,
  rc::Rc,
};

use the_bus::{
  BroadcastMessage,
  Identity,
  MessageBus,
  TargetedMessage,
};

struct Damage {
  amount: u32,
}
impl TargetedMessage for Damage {}

struct Died;
impl BroadcastMessage for Died {}

fn main() -> anyhow::Result<()> {
  env_logger::init();

  let bus = MessageBus::new();
  let hero = Identity::from_raw(1);
  let boss = Identity::from_raw(2);

  let hero_token = bus.token(hero)?;
  let boss_token = bus.token(boss)?;

  // The hero takes damage, dies at zero, and announces it as a broadcast.
  let hero_hp = Rc::new(Cell::new(30u32));
  {
    let hp = Rc::clone(&hero_hp);
    let bus = bus.clone();
    hero_token.register_targeted::<Damage, _>(hero, 0, move |msg| {
      let remaining = hp.get().saturating_sub(msg.amount);
      hp.set(remaining);
      println!("hero takes {} damage, {} hp left", msg.amount, remaining);
      if remaining == 0 {
        bus.emit_broadcast(hero, &Died);
      }
    })?;
  }

  // God mode: an interceptor that caps any single hit on the hero at 10.
  hero_token.register_targeted_interceptor_for::<Damage, _>(hero, -100, |msg| {
    if msg.amount > 50 {
      println!("blocked an absurd {}-damage hit", msg.amount);
      false
    } else {
      true
    }
  })?;

  // The boss gloats over every death on the field.
  boss_token.register_broadcast_any::<Died, _>(0, |who, _| {
    println!("boss laughs at {who}");
  })?;

  // A combat log sees every targeted hit, after the handlers ran.
  hero_token.register_targeted_any_post_processor::<Damage, _>(0, |target, msg| {
    println!("[log] {} damage resolved against {target}", msg.amount);
  })?;

  bus.emit_targeted(hero, &Damage { amount: 12 });
  bus.emit_targeted(hero, &Damage { amount: 999 });
  bus.emit_targeted(hero, &Damage { amount: 25 });

  println!("emissions so far: {}", bus.emission_id() + 1);
  Ok(())
}
