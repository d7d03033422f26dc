use std::panic::{
  AssertUnwindSafe,
  catch_unwind,
};

use the_bus::{
  DiagnosticsMode,
  DispatchShape,
  EmissionOutcome,
  HandlerKind,
  Identity,
  MessageBus,
  UntargetedMessage,
};

struct Tick;
impl UntargetedMessage for Tick {}

struct Nudge;
impl the_bus::TargetedMessage for Nudge {}

#[test]
fn emission_ids_are_sequential_from_zero() {
  let bus = MessageBus::new();
  assert_eq!(bus.emission_id(), -1);

  bus.emit_untargeted(&Tick);
  assert_eq!(bus.emission_id(), 0);
  bus.emit_untargeted(&Tick);
  assert_eq!(bus.emission_id(), 1);
}

#[test]
fn bus_ring_records_every_emission_outcome() {
  the_bus::set_diagnostics_mode(DiagnosticsMode::Bus);
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();

  // Completed.
  bus.emit_untargeted(&Tick);

  // Cancelled by interceptor.
  let veto = token
    .register_untargeted_interceptor::<Tick, _>(0, |_| false)
    .unwrap();
  bus.emit_untargeted(&Tick);
  token.remove_registration(veto);

  // Faulted: the record is written before the panic resumes unwinding.
  token
    .register_untargeted::<Tick, _>(0, |_: &Tick| panic!("boom"))
    .unwrap();
  let result = catch_unwind(AssertUnwindSafe(|| bus.emit_untargeted(&Tick)));
  assert!(result.is_err());

  let ring = bus.emission_ring();
  assert_eq!(ring.len(), 3);
  assert_eq!(ring[0].outcome, EmissionOutcome::Completed);
  assert_eq!(ring[1].outcome, EmissionOutcome::Cancelled);
  assert_eq!(ring[2].outcome, EmissionOutcome::Faulted);
  assert_eq!(ring[0].sequence, 0);
  assert_eq!(ring[2].sequence, 2);
  assert!(ring[0].type_name.contains("Tick"));
  assert!(ring[0].context.is_none());

  the_bus::set_diagnostics_mode(DiagnosticsMode::Off);
}

#[test]
fn targeted_records_carry_the_context_identity() {
  the_bus::set_diagnostics_mode(DiagnosticsMode::Bus);
  let bus = MessageBus::new();
  let target = Identity::from_raw(31);

  bus.emit_targeted(target, &Nudge);

  let ring = bus.emission_ring();
  assert_eq!(ring.len(), 1);
  assert_eq!(ring[0].context, Some(target));

  the_bus::set_diagnostics_mode(DiagnosticsMode::Off);
}

// Property 7: the ring retains the newest `capacity` records.
#[test]
fn ring_capacity_and_resize_keep_newest() {
  the_bus::set_diagnostics_mode(DiagnosticsMode::Bus);
  the_bus::set_diagnostics_buffer_size(3);
  let bus = MessageBus::new();

  for _ in 0..5 {
    bus.emit_untargeted(&Tick);
  }
  let ring = bus.emission_ring();
  assert_eq!(ring.len(), 3);
  let sequences: Vec<i64> = ring.iter().map(|record| record.sequence).collect();
  assert_eq!(sequences, vec![2, 3, 4]);

  bus.resize_emission_ring(2);
  let sequences: Vec<i64> = bus.emission_ring().iter().map(|record| record.sequence).collect();
  assert_eq!(sequences, vec![3, 4]);

  the_bus::set_diagnostics_buffer_size(the_bus::DEFAULT_DIAGNOSTICS_BUFFER_SIZE);
  the_bus::set_diagnostics_mode(DiagnosticsMode::Off);
}

#[test]
fn token_diagnostics_count_per_handle() {
  the_bus::set_diagnostics_mode(DiagnosticsMode::All);
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();

  let first = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();
  let second = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();

  bus.emit_untargeted(&Tick);
  bus.emit_untargeted(&Tick);

  assert_eq!(token.call_count(first), 2);
  assert_eq!(token.call_count(second), 2);
  assert_eq!(token.call_count(the_bus::RegistrationHandle::INVALID), 0);

  // One ring entry per invocation routed through the token.
  assert_eq!(token.emission_ring().len(), 4);

  the_bus::set_diagnostics_mode(DiagnosticsMode::Off);
}

#[test]
fn diagnostics_off_records_nothing() {
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let handle = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();

  bus.emit_untargeted(&Tick);

  assert!(bus.emission_ring().is_empty());
  assert_eq!(token.call_count(handle), 0);
  assert!(token.emission_ring().is_empty());
}

#[test]
fn counts_track_shape_and_kind() {
  let bus = MessageBus::new();
  let target = Identity::from_raw(4);
  let token = bus.token(target).unwrap();

  token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();
  token.register_untargeted::<Tick, _>(1, |_| {}).unwrap();
  token.register_untargeted_interceptor::<Tick, _>(0, |_| true).unwrap();
  token.register_targeted::<Nudge, _>(target, 0, |_| {}).unwrap();
  token.register_targeted_any::<Nudge, _>(0, |_, _| {}).unwrap();
  token
    .register_targeted_any_post_processor::<Nudge, _>(0, |_, _| {})
    .unwrap();

  assert_eq!(bus.handler_count(DispatchShape::Untargeted), 2);
  assert_eq!(bus.count_of(DispatchShape::Untargeted, HandlerKind::Interceptor), 1);
  assert_eq!(bus.handler_count(DispatchShape::Targeted), 1);
  assert_eq!(bus.handler_count(DispatchShape::TargetedAny), 1);
  assert_eq!(
    bus.count_of(DispatchShape::TargetedAny, HandlerKind::PostProcessor),
    1
  );
  assert_eq!(bus.handler_count(DispatchShape::Broadcast), 0);

  let handle = token.handles()[0];
  token.remove_registration(handle);
  assert_eq!(bus.handler_count(DispatchShape::Untargeted), 1);
}

// Property 6: message type indices survive reset.
#[test]
fn reset_preserves_type_indices() {
  struct Unique1;
  struct Unique2;

  let first = the_bus::type_index::<Unique1>();
  let second = the_bus::type_index::<Unique2>();
  let count_before = the_bus::observed_type_count();

  the_bus::reset();

  assert_eq!(the_bus::type_index::<Unique1>(), first);
  assert_eq!(the_bus::type_index::<Unique2>(), second);
  assert!(the_bus::observed_type_count() >= count_before);
  assert!(count_before > first.raw());
  assert!(count_before > second.raw());
}

// Property 8: reset restarts the handle counter.
#[test]
fn reset_restarts_handle_minting() {
  the_bus::reset();
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let first = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();
  let _ = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();

  the_bus::reset();
  let bus = MessageBus::new();
  let token = bus.token(Identity::from_raw(1)).unwrap();
  let reborn = token.register_untargeted::<Tick, _>(0, |_| {}).unwrap();

  assert_eq!(first, reborn);
}

#[test]
fn reset_restores_global_defaults() {
  the_bus::set_diagnostics_mode(DiagnosticsMode::All);
  the_bus::set_diagnostics_buffer_size(7);
  the_bus::default_bus().emit_untargeted(&Tick);
  assert_eq!(the_bus::default_bus().emission_id(), 0);

  the_bus::reset();

  assert_eq!(the_bus::diagnostics_mode(), DiagnosticsMode::Off);
  assert_eq!(
    the_bus::diagnostics_buffer_size(),
    the_bus::DEFAULT_DIAGNOSTICS_BUFFER_SIZE
  );
  // Fresh default bus, pre-first emission counter.
  assert_eq!(the_bus::default_bus().emission_id(), -1);
}

#[test]
fn replace_and_restore_default_bus() {
  let replacement = MessageBus::new();
  replacement.emit_untargeted(&Tick);
  let previous = the_bus::replace_default_bus(replacement);
  assert_eq!(previous.emission_id(), -1);
  assert_eq!(the_bus::default_bus().emission_id(), 0);

  the_bus::restore_default_bus();
  assert_eq!(the_bus::default_bus().emission_id(), -1);
}
