//! Process-wide mutable state: the default bus and diagnostic knobs.
//!
//! The bus is single-threaded, so "process-wide" state is thread-local:
//! every thread gets its own default bus and configuration, which also keeps
//! parallel test runs from trampling each other. The message type registry
//! (`type_index`) is the deliberate exception and is shared across threads.

use std::cell::RefCell;

use crate::{
  bus::MessageBus,
  diagnostics::DiagnosticsMode,
  handle,
  identity::Identity,
  message::{
    BroadcastMessage,
    TargetedMessage,
    UntargetedMessage,
  },
};

/// Default capacity of the per-bus and per-token diagnostic rings.
pub const DEFAULT_DIAGNOSTICS_BUFFER_SIZE: usize = 100;

struct ProcessState {
  default_bus: Option<MessageBus>,
  diagnostics: DiagnosticsMode,
  buffer_size: usize,
}

thread_local! {
  static STATE: RefCell<ProcessState> = RefCell::new(ProcessState {
    default_bus: None,
    diagnostics: DiagnosticsMode::Off,
    buffer_size: DEFAULT_DIAGNOSTICS_BUFFER_SIZE,
  });
}

/// The process-wide default bus, created lazily on first use.
pub fn default_bus() -> MessageBus {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    let size = state.buffer_size;
    state
      .default_bus
      .get_or_insert_with(|| MessageBus::with_ring_capacity(size))
      .clone()
  })
}

/// Install `bus` as the default, returning the bus it replaces.
pub fn replace_default_bus(bus: MessageBus) -> MessageBus {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    let size = state.buffer_size;
    let previous = state
      .default_bus
      .take()
      .unwrap_or_else(|| MessageBus::with_ring_capacity(size));
    state.default_bus = Some(bus);
    previous
  })
}

/// Throw away the current default bus and install a fresh one.
pub fn restore_default_bus() -> MessageBus {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    let bus = MessageBus::with_ring_capacity(state.buffer_size);
    state.default_bus = Some(bus.clone());
    bus
  })
}

pub fn diagnostics_mode() -> DiagnosticsMode {
  STATE.with(|state| state.borrow().diagnostics)
}

pub fn set_diagnostics_mode(mode: DiagnosticsMode) {
  STATE.with(|state| state.borrow_mut().diagnostics = mode);
}

/// Default ring capacity applied to buses and tokens created afterwards.
pub fn diagnostics_buffer_size() -> usize {
  STATE.with(|state| state.borrow().buffer_size)
}

pub fn set_diagnostics_buffer_size(size: usize) {
  STATE.with(|state| state.borrow_mut().buffer_size = size);
}

/// Restore every process-wide default: a fresh default bus, diagnostics off,
/// default buffer size, and a restarted handle counter.
///
/// Message type indices deliberately survive; see `type_index`.
pub fn reset() {
  STATE.with(|state| {
    let mut state = state.borrow_mut();
    state.default_bus = None;
    state.diagnostics = DiagnosticsMode::Off;
    state.buffer_size = DEFAULT_DIAGNOSTICS_BUFFER_SIZE;
  });
  handle::reset_handle_counter();
  log::debug!("process-wide bus state reset");
}

/// Emit on the default bus. See `MessageBus::emit_untargeted`.
pub fn emit_untargeted<M: UntargetedMessage>(msg: &M) {
  default_bus().emit_untargeted(msg);
}

/// Emit on the default bus. See `MessageBus::emit_targeted`.
pub fn emit_targeted<M: TargetedMessage>(target: Identity, msg: &M) {
  default_bus().emit_targeted(target, msg);
}

/// Emit on the default bus. See `MessageBus::emit_broadcast`.
pub fn emit_broadcast<M: BroadcastMessage>(source: Identity, msg: &M) {
  default_bus().emit_broadcast(source, msg);
}
