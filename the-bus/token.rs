//! Subscriber-facing registration tokens.
//!
//! A token aggregates every handle a subscriber owns on one bus and gives
//! them a single enable/disable switch. Tokens are minted by
//! `MessageBus::token` and are idempotent per (owner, bus): the bus hands
//! back the existing token while one is alive. When diagnostics include the
//! token sink, every invocation routed through a token is counted per handle
//! and appended to the token's own ring.

use std::{
  cell::{
    Cell,
    RefCell,
  },
  rc::{
    Rc,
    Weak,
  },
  time::SystemTime,
};

use hashbrown::HashMap;

use crate::{
  bus::{
    Disposer,
    InvocationCtx,
    MessageBus,
  },
  diagnostics::{
    EmissionOutcome,
    EmissionRecord,
    capture_stack,
  },
  error::Result,
  handle::RegistrationHandle,
  identity::Identity,
  list::EntryState,
  message::{
    BroadcastMessage,
    Message,
    TargetedMessage,
    UntargetedMessage,
  },
  ring::CyclicBuffer,
};

pub(crate) struct TokenCore {
  owner:   Identity,
  bus:     MessageBus,
  enabled: Cell<bool>,
  handles: RefCell<Vec<(RegistrationHandle, Rc<EntryState>)>>,
  counts:  RefCell<HashMap<RegistrationHandle, u64>>,
  ring:    RefCell<CyclicBuffer<EmissionRecord>>,
}

impl TokenCore {
  pub(crate) fn new(owner: Identity, bus: MessageBus) -> Rc<Self> {
    Rc::new(TokenCore {
      owner,
      bus,
      enabled: Cell::new(true),
      handles: RefCell::new(Vec::new()),
      counts:  RefCell::new(HashMap::new()),
      ring:    RefCell::new(CyclicBuffer::new(crate::globals::diagnostics_buffer_size())),
    })
  }

  pub(crate) fn bus(&self) -> &MessageBus {
    &self.bus
  }

  pub(crate) fn record(&self, handle: RegistrationHandle, state: Rc<EntryState>) {
    self.handles.borrow_mut().push((handle, state));
  }

  pub(crate) fn forget(&self, handle: RegistrationHandle) {
    self.handles.borrow_mut().retain(|(owned, _)| *owned != handle);
    self.counts.borrow_mut().remove(&handle);
  }

  pub(crate) fn set_enabled(&self, enabled: bool) {
    self.enabled.set(enabled);
    for (_, state) in self.handles.borrow().iter() {
      state.set_enabled(enabled);
    }
  }

  pub(crate) fn note_invocation(&self, handle: RegistrationHandle, ctx: &InvocationCtx) {
    *self.counts.borrow_mut().entry(handle).or_insert(0) += 1;
    self.ring.borrow_mut().push(EmissionRecord {
      type_index: ctx.type_index,
      type_name:  ctx.type_name,
      context:    ctx.context,
      stack:      capture_stack(),
      timestamp:  SystemTime::now(),
      sequence:   ctx.sequence,
      outcome:    EmissionOutcome::Completed,
    });
  }
}

/// A subscriber's aggregate of registrations on one bus.
///
/// Cloning yields another handle to the same token.
pub struct RegistrationToken {
  core: Rc<TokenCore>,
}

impl std::fmt::Debug for RegistrationToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RegistrationToken")
      .field("owner", &self.core.owner)
      .finish()
  }
}

impl Clone for RegistrationToken {
  fn clone(&self) -> Self {
    RegistrationToken {
      core: Rc::clone(&self.core),
    }
  }
}

impl RegistrationToken {
  pub(crate) fn from_core(core: Rc<TokenCore>) -> Self {
    RegistrationToken { core }
  }

  pub(crate) fn core(&self) -> &Rc<TokenCore> {
    &self.core
  }

  pub(crate) fn core_weak(&self) -> Weak<TokenCore> {
    Rc::downgrade(&self.core)
  }

  pub fn owner(&self) -> Identity {
    self.core.owner
  }

  /// The bus this token is bound to. Tokens cannot be re-bound.
  pub fn bus(&self) -> &MessageBus {
    self.core.bus()
  }

  pub fn is_enabled(&self) -> bool {
    self.core.enabled.get()
  }

  /// Activate every entry this token owns. Entries registered while the
  /// token was disabled light up here.
  pub fn enable(&self) {
    if !self.core.enabled.get() {
      self.core.set_enabled(true);
      log::trace!("enabled token for {}", self.core.owner);
    }
  }

  /// Suppress every entry this token owns without removing them.
  pub fn disable(&self) {
    if self.core.enabled.get() {
      self.core.set_enabled(false);
      log::trace!("disabled token for {}", self.core.owner);
    }
  }

  /// Number of registrations this token currently owns.
  pub fn registration_count(&self) -> usize {
    self.core.handles.borrow().len()
  }

  /// Handles of every owned registration, in registration order.
  pub fn handles(&self) -> Vec<RegistrationHandle> {
    self.core.handles.borrow().iter().map(|(handle, _)| *handle).collect()
  }

  /// Remove one owned registration. Idempotent for unknown handles.
  pub fn remove_registration(&self, handle: RegistrationHandle) -> bool {
    self.core.bus.remove_registration(handle)
  }

  /// Remove every registration this token owns.
  pub fn unregister_all(&self) {
    let handles: Vec<RegistrationHandle> =
      self.core.handles.borrow().iter().map(|(handle, _)| *handle).collect();
    for handle in handles {
      self.core.bus.remove_registration(handle);
    }
    log::trace!("unregistered all handles of token for {}", self.core.owner);
  }

  /// Invocations counted against `handle` while token diagnostics were on.
  pub fn call_count(&self, handle: RegistrationHandle) -> u64 {
    self.core.counts.borrow().get(&handle).copied().unwrap_or(0)
  }

  /// Snapshot of the per-token invocation ring, oldest record first.
  pub fn emission_ring(&self) -> Vec<EmissionRecord> {
    self.core.ring.borrow().to_vec()
  }

  /// Resize the invocation ring, keeping the newest records.
  pub fn resize_emission_ring(&self, capacity: usize) {
    self.core.ring.borrow_mut().resize(capacity);
  }

  // ---------------------------------------------------------------------
  // Registration forwarding. Every call mints an entry in the bound bus
  // and records the handle against this token.
  // ---------------------------------------------------------------------

  pub fn register_untargeted<M, F>(&self, priority: i32, handler: F) -> Result<RegistrationHandle>
  where
    M: UntargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(self.core.bus.register_untargeted::<M, F>(self, priority, handler))
  }

  pub fn register_targeted<M, F>(
    &self,
    target: Identity,
    priority: i32,
    handler: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(self.core.bus.register_targeted::<M, F>(self, target, priority, handler))
  }

  pub fn register_targeted_any<M, F>(&self, priority: i32, handler: F) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.finish(self.core.bus.register_targeted_any::<M, F>(self, priority, handler))
  }

  pub fn register_broadcast<M, F>(
    &self,
    source: Identity,
    priority: i32,
    handler: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(self.core.bus.register_broadcast::<M, F>(self, source, priority, handler))
  }

  pub fn register_broadcast_any<M, F>(&self, priority: i32, handler: F) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.finish(self.core.bus.register_broadcast_any::<M, F>(self, priority, handler))
  }

  pub fn register_untargeted_interceptor<M, F>(
    &self,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: UntargetedMessage,
    F: Fn(&M) -> bool + 'static,
  {
    self.finish(self.core.bus.register_untargeted_interceptor::<M, F>(self, priority, interceptor))
  }

  pub fn register_targeted_interceptor<M, F>(
    &self,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.finish(self.core.bus.register_targeted_interceptor::<M, F>(self, priority, interceptor))
  }

  pub fn register_targeted_interceptor_for<M, F>(
    &self,
    target: Identity,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(&M) -> bool + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_targeted_interceptor_for::<M, F>(self, target, priority, interceptor),
    )
  }

  pub fn register_targeted_any_interceptor<M, F>(
    &self,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_targeted_any_interceptor::<M, F>(self, priority, interceptor),
    )
  }

  pub fn register_broadcast_interceptor<M, F>(
    &self,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.finish(self.core.bus.register_broadcast_interceptor::<M, F>(self, priority, interceptor))
  }

  pub fn register_broadcast_interceptor_for<M, F>(
    &self,
    source: Identity,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(&M) -> bool + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_broadcast_interceptor_for::<M, F>(self, source, priority, interceptor),
    )
  }

  pub fn register_broadcast_any_interceptor<M, F>(
    &self,
    priority: i32,
    interceptor: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_broadcast_any_interceptor::<M, F>(self, priority, interceptor),
    )
  }

  pub fn register_untargeted_post_processor<M, F>(
    &self,
    priority: i32,
    post: F,
  ) -> Result<RegistrationHandle>
  where
    M: UntargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(self.core.bus.register_untargeted_post_processor::<M, F>(self, priority, post))
  }

  pub fn register_targeted_post_processor<M, F>(
    &self,
    target: Identity,
    priority: i32,
    post: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_targeted_post_processor::<M, F>(self, target, priority, post),
    )
  }

  pub fn register_targeted_any_post_processor<M, F>(
    &self,
    priority: i32,
    post: F,
  ) -> Result<RegistrationHandle>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_targeted_any_post_processor::<M, F>(self, priority, post),
    )
  }

  pub fn register_broadcast_post_processor<M, F>(
    &self,
    source: Identity,
    priority: i32,
    post: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(&M) + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_broadcast_post_processor::<M, F>(self, source, priority, post),
    )
  }

  pub fn register_broadcast_any_post_processor<M, F>(
    &self,
    priority: i32,
    post: F,
  ) -> Result<RegistrationHandle>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_broadcast_any_post_processor::<M, F>(self, priority, post),
    )
  }

  pub fn register_global_accept_all<U, T, B>(
    &self,
    priority: i32,
    untargeted: U,
    targeted: T,
    broadcast: B,
  ) -> Result<RegistrationHandle>
  where
    U: Fn(&dyn Message) + 'static,
    T: Fn(Identity, &dyn Message) + 'static,
    B: Fn(Identity, &dyn Message) + 'static,
  {
    self.finish(
      self
        .core
        .bus
        .register_global_accept_all(self, priority, untargeted, targeted, broadcast),
    )
  }

  fn finish(&self, result: Result<(RegistrationHandle, Disposer)>) -> Result<RegistrationHandle> {
    result.map(|(handle, _disposer)| handle)
  }
}
