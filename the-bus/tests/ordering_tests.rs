use std::{
  cell::RefCell,
  rc::Rc,
};

use the_bus::{
  Identity,
  Message,
  MessageBus,
  TargetedMessage,
  UntargetedMessage,
};

struct Tick;
impl UntargetedMessage for Tick {}

struct Poke;
impl TargetedMessage for Poke {}

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
  Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
  log.borrow_mut().push(entry.into());
}

// Property 4: within one list, invocation order is the stable sort by
// (priority, insertion sequence).
#[test]
fn handlers_run_in_priority_then_insertion_order() {
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let order = log();

  for (label, priority) in [("b", 5), ("a", -3), ("c", 5), ("d", 0), ("e", -3)] {
    let sink = Rc::clone(&order);
    token
      .register_untargeted::<Tick, _>(priority, move |_| push(&sink, label))
      .unwrap();
  }

  bus.emit_untargeted(&Tick);
  // -3 first (a then e, insertion order), then 0, then both 5s in
  // insertion order.
  assert_eq!(*order.borrow(), vec!["a", "e", "d", "b", "c"]);
}

// S5: large priority sweep; handlers strictly ascending per emission,
// post-processors strictly after all handlers, every entry once per
// emission.
#[test]
fn priority_sweep_with_post_processors() {
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let order: Rc<RefCell<Vec<(u8, i32)>>> = Rc::new(RefCell::new(Vec::new()));

  for priority in (0..100).rev() {
    let sink = Rc::clone(&order);
    token
      .register_untargeted::<Tick, _>(priority, move |_| sink.borrow_mut().push((0, priority)))
      .unwrap();
  }
  for priority in (0..100).rev() {
    let sink = Rc::clone(&order);
    token
      .register_untargeted_post_processor::<Tick, _>(priority, move |_| {
        sink.borrow_mut().push((1, priority))
      })
      .unwrap();
  }

  let emissions = 3;
  for _ in 0..emissions {
    bus.emit_untargeted(&Tick);
  }

  let order = order.borrow();
  assert_eq!(order.len(), 200 * emissions);
  for chunk in order.chunks(200) {
    let (handlers, posts) = chunk.split_at(100);
    assert!(handlers.iter().all(|(block, _)| *block == 0));
    assert!(posts.iter().all(|(block, _)| *block == 1));
    for (expected, (_, priority)) in handlers.iter().enumerate() {
      assert_eq!(*priority, expected as i32);
    }
    for (expected, (_, priority)) in posts.iter().enumerate() {
      assert_eq!(*priority, expected as i32);
    }
  }
}

// Keyed and "any" handler lists interleave by priority, with the keyed
// list winning ties.
#[test]
fn keyed_and_any_lists_interleave_by_priority() {
  let bus = MessageBus::new();
  let target = Identity::from_raw(9);
  let token = bus.token(target).unwrap();
  let order = log();

  let sink = Rc::clone(&order);
  token
    .register_targeted::<Poke, _>(target, 5, move |_| push(&sink, "keyed:5"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_targeted_any::<Poke, _>(0, move |_, _| push(&sink, "any:0"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_targeted_any::<Poke, _>(5, move |_, _| push(&sink, "any:5"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_targeted::<Poke, _>(target, -1, move |_| push(&sink, "keyed:-1"))
    .unwrap();

  bus.emit_targeted(target, &Poke);
  assert_eq!(
    *order.borrow(),
    vec!["keyed:-1", "any:0", "keyed:5", "any:5"]
  );
}

// Blocks run in pipeline order: interceptors, normal handlers, accept-all
// observers, post-processors.
#[test]
fn pipeline_blocks_run_in_fixed_order() {
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let order = log();

  let sink = Rc::clone(&order);
  token
    .register_untargeted_post_processor::<Tick, _>(-100, move |_| push(&sink, "post"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_global_accept_all(
      -100,
      move |_: &dyn Message| push(&sink, "accept-all"),
      |_: Identity, _: &dyn Message| {},
      |_: Identity, _: &dyn Message| {},
    )
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_untargeted::<Tick, _>(100, move |_| push(&sink, "handler"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_untargeted_interceptor::<Tick, _>(100, move |_| {
      push(&sink, "interceptor");
      true
    })
    .unwrap();

  bus.emit_untargeted(&Tick);
  assert_eq!(
    *order.borrow(),
    vec!["interceptor", "handler", "accept-all", "post"]
  );
}

// A single emission invokes each entry at most once, even when an entry
// could be reached through several lists.
#[test]
fn one_emission_never_reinvokes_an_entry() {
  let bus = MessageBus::new();
  let target = Identity::from_raw(2);
  let token = bus.token(target).unwrap();
  let order = log();

  let sink = Rc::clone(&order);
  token
    .register_targeted::<Poke, _>(target, 0, move |_| push(&sink, "keyed"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_targeted_any::<Poke, _>(0, move |_, _| push(&sink, "any"))
    .unwrap();
  let sink = Rc::clone(&order);
  token
    .register_targeted_any_post_processor::<Poke, _>(0, move |_, _| push(&sink, "post"))
    .unwrap();

  bus.emit_targeted(target, &Poke);
  bus.emit_targeted(target, &Poke);

  assert_eq!(
    *order.borrow(),
    vec!["keyed", "any", "post", "keyed", "any", "post"]
  );
}
