//! The message bus: registration surface and emission pipeline.
//!
//! A bus owns one handler table per message type, the global accept-all
//! list, the emission counter, and the per-bus diagnostic ring. Everything
//! is single-threaded: interior mutability is `Rc`/`RefCell`/`Cell`, and
//! re-entrancy safety comes from snapshot-on-first-touch (see `list`), not
//! from locking. No `RefCell` borrow is ever held across a user handler
//! invocation.

use std::{
  any::TypeId,
  cell::{
    Cell,
    RefCell,
  },
  panic::{
    AssertUnwindSafe,
    catch_unwind,
    resume_unwind,
  },
  rc::{
    Rc,
    Weak,
  },
  time::SystemTime,
};

use hashbrown::{
  HashMap,
  HashSet,
};
use smallvec::SmallVec;

use crate::{
  adapter::HostAdapter,
  diagnostics::{
    DiagnosticsMode,
    EmissionOutcome,
    EmissionRecord,
    capture_stack,
  },
  error::{
    BusError,
    Result,
  },
  handle::{
    RegistrationHandle,
    mint_handle,
  },
  identity::Identity,
  list::{
    EntryState,
    HandlerEntry,
    HandlerList,
    OrderedMerge,
    Snapshot,
  },
  message::{
    BroadcastMessage,
    Message,
    TargetedMessage,
    UntargetedMessage,
  },
  ring::CyclicBuffer,
  shape::{
    DispatchShape,
    HandlerKind,
  },
  table::{
    ErasedTable,
    HandlerTable,
    InterceptFn,
    KindLists,
    NormalFn,
  },
  token::{
    RegistrationToken,
    TokenCore,
  },
  type_index::{
    MessageTypeIndex,
    type_index,
    type_index_of,
  },
};

/// The global accept-all callbacks of one registration: one per dispatch
/// shape, all type-erased.
pub(crate) struct AcceptAllFns {
  untargeted: Rc<dyn Fn(&dyn Message)>,
  targeted:   Rc<dyn Fn(Identity, &dyn Message)>,
  broadcast:  Rc<dyn Fn(Identity, &dyn Message)>,
}

impl Clone for AcceptAllFns {
  fn clone(&self) -> Self {
    AcceptAllFns {
      untargeted: Rc::clone(&self.untargeted),
      targeted:   Rc::clone(&self.targeted),
      broadcast:  Rc::clone(&self.broadcast),
    }
  }
}

/// Per-emission constants handed to diagnostic sinks.
pub(crate) struct InvocationCtx {
  pub sequence:   i64,
  pub type_index: MessageTypeIndex,
  pub type_name:  &'static str,
  pub context:    Option<Identity>,
  pub token_diag: bool,
}

#[derive(Clone, Copy)]
enum EmitKind {
  Untargeted,
  Targeted(Identity),
  Broadcast(Identity),
}

impl EmitKind {
  fn context(self) -> Option<Identity> {
    match self {
      EmitKind::Untargeted => None,
      EmitKind::Targeted(key) | EmitKind::Broadcast(key) => Some(key),
    }
  }

  fn source(self) -> Identity {
    self.context().unwrap_or(Identity::NONE)
  }
}

struct HandleSlot {
  state:  Rc<EntryState>,
  /// Structurally removes the entry from its list.
  detach: Box<dyn Fn()>,
}

pub(crate) struct BusInner {
  tables:        RefCell<HashMap<TypeId, Rc<dyn ErasedTable>>>,
  accept_all:    Rc<HandlerList<AcceptAllFns>>,
  handles:       RefCell<HashMap<RegistrationHandle, HandleSlot>>,
  /// Entry states by addressing key, so `deactivate` can flip them all.
  keyed:         RefCell<HashMap<Identity, Vec<Rc<EntryState>>>>,
  tokens:        RefCell<HashMap<Identity, Weak<TokenCore>>>,
  dead:          RefCell<HashSet<Identity>>,
  adapter:       RefCell<Option<Rc<dyn HostAdapter>>>,
  /// -1 before the first emission; each emission pre-increments.
  emissions:     Cell<i64>,
  /// Monotonic insertion sequence shared by every list of this bus.
  insertions:    Cell<u64>,
  fault_isolate: Cell<bool>,
  ring:          RefCell<CyclicBuffer<EmissionRecord>>,
}

impl BusInner {
  pub(crate) fn remove_handle(&self, handle: RegistrationHandle) -> bool {
    let slot = self.handles.borrow_mut().remove(&handle);
    let Some(slot) = slot else {
      return false;
    };
    slot.state.mark_removed();
    (slot.detach)();
    if let Some(core) = slot.state.owner.upgrade() {
      core.forget(handle);
    }
    log::trace!("removed registration {handle:?}");
    true
  }
}

/// Deferred unregistration for one handler entry.
///
/// The Rust shape of the "disposer closure" every registration returns:
/// consuming [`dispose`](Disposer::dispose) is equivalent to calling
/// `MessageBus::remove_registration` with the same handle, and is a no-op if
/// the entry (or the whole bus) is already gone.
pub struct Disposer {
  bus:    Weak<BusInner>,
  handle: RegistrationHandle,
}

impl std::fmt::Debug for Disposer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Disposer")
      .field("handle", &self.handle)
      .finish()
  }
}

impl Disposer {
  pub fn handle(&self) -> RegistrationHandle {
    self.handle
  }

  pub fn dispose(self) -> bool {
    match self.bus.upgrade() {
      Some(inner) => inner.remove_handle(self.handle),
      None => false,
    }
  }
}

/// An in-process, strongly-typed publish/subscribe dispatcher.
///
/// Cloning is cheap and yields another handle to the same bus. All methods
/// must be called from the thread that created the bus; the type is
/// deliberately neither `Send` nor `Sync`.
pub struct MessageBus {
  inner: Rc<BusInner>,
}

impl Clone for MessageBus {
  fn clone(&self) -> Self {
    MessageBus {
      inner: Rc::clone(&self.inner),
    }
  }
}

impl Default for MessageBus {
  fn default() -> Self {
    MessageBus::new()
  }
}

impl MessageBus {
  /// A fresh bus whose diagnostic ring uses the process-wide default
  /// capacity.
  pub fn new() -> Self {
    MessageBus::with_ring_capacity(crate::globals::diagnostics_buffer_size())
  }

  /// A fresh bus with an explicit diagnostic ring capacity.
  pub fn with_ring_capacity(capacity: usize) -> Self {
    MessageBus {
      inner: Rc::new(BusInner {
        tables:        RefCell::new(HashMap::new()),
        accept_all:    HandlerList::new(),
        handles:       RefCell::new(HashMap::new()),
        keyed:         RefCell::new(HashMap::new()),
        tokens:        RefCell::new(HashMap::new()),
        dead:          RefCell::new(HashSet::new()),
        adapter:       RefCell::new(None),
        emissions:     Cell::new(-1),
        insertions:    Cell::new(0),
        fault_isolate: Cell::new(false),
        ring:          RefCell::new(CyclicBuffer::new(capacity)),
      }),
    }
  }

  pub(crate) fn inner_rc(&self) -> &Rc<BusInner> {
    &self.inner
  }

  // ---------------------------------------------------------------------
  // Tokens and lifecycle
  // ---------------------------------------------------------------------

  /// The registration token for `owner` on this bus.
  ///
  /// Idempotent: asking twice for the same owner returns the same token as
  /// long as the first one is still alive. A `NONE` owner is refused.
  pub fn token(&self, owner: Identity) -> Result<RegistrationToken> {
    if owner.is_none() {
      return Err(BusError::InvalidInput("token owner must not be Identity::NONE"));
    }
    let existing = self.inner.tokens.borrow().get(&owner).and_then(Weak::upgrade);
    if let Some(core) = existing {
      return Ok(RegistrationToken::from_core(core));
    }
    let core = TokenCore::new(owner, self.clone());
    self.inner.tokens.borrow_mut().insert(owner, Rc::downgrade(&core));
    log::trace!("created token for {owner}");
    Ok(RegistrationToken::from_core(core))
  }

  /// Install a host liveness oracle. Identities the bus was told to
  /// `deactivate` stay dead regardless of the adapter's answer.
  pub fn set_host_adapter(&self, adapter: impl HostAdapter + 'static) {
    *self.inner.adapter.borrow_mut() = Some(Rc::new(adapter));
  }

  pub fn is_alive(&self, identity: Identity) -> bool {
    if identity.is_none() {
      return false;
    }
    if self.inner.dead.borrow().contains(&identity) {
      return false;
    }
    let adapter = self.inner.adapter.borrow().clone();
    match adapter {
      Some(adapter) => adapter.is_alive(identity),
      None => true,
    }
  }

  /// Lifecycle callback: `identity` was destroyed.
  ///
  /// Flips every entry keyed on it inactive, disables the token it owns,
  /// and marks it dead for future targeted/broadcast emissions. Entries in
  /// snapshots already bound by an in-flight emission are skipped at call
  /// time.
  pub fn deactivate(&self, identity: Identity) {
    if identity.is_none() {
      return;
    }
    self.inner.dead.borrow_mut().insert(identity);
    let states = self.inner.keyed.borrow_mut().remove(&identity);
    if let Some(states) = states {
      for state in &states {
        state.kill_key();
      }
    }
    let token = self.inner.tokens.borrow().get(&identity).and_then(Weak::upgrade);
    if let Some(core) = token {
      core.set_enabled(false);
    }
    log::debug!("deactivated {identity}");
  }

  /// Remove a single registration by handle. Idempotent for unknown or
  /// already removed handles.
  pub fn remove_registration(&self, handle: RegistrationHandle) -> bool {
    self.inner.remove_handle(handle)
  }

  // ---------------------------------------------------------------------
  // Diagnostics accessors
  // ---------------------------------------------------------------------

  pub fn diagnostics_mode(&self) -> DiagnosticsMode {
    crate::globals::diagnostics_mode()
  }

  /// Sequence id of the most recent emission, `-1` before the first.
  pub fn emission_id(&self) -> i64 {
    self.inner.emissions.get()
  }

  /// Number of registered normal handlers for `shape`.
  pub fn handler_count(&self, shape: DispatchShape) -> usize {
    self.count_of(shape, HandlerKind::Normal)
  }

  /// Number of registered handlers for `(shape, kind)`, across all message
  /// types. Disabled entries count; removed ones do not.
  pub fn count_of(&self, shape: DispatchShape, kind: HandlerKind) -> usize {
    if shape == DispatchShape::GlobalAcceptAll {
      return match kind {
        HandlerKind::Normal => self.inner.accept_all.len(),
        _ => 0,
      };
    }
    self
      .inner
      .tables
      .borrow()
      .values()
      .map(|table| table.count_of_erased(shape, kind))
      .sum()
  }

  /// Snapshot of the per-bus emission ring, oldest record first.
  pub fn emission_ring(&self) -> Vec<EmissionRecord> {
    self.inner.ring.borrow().to_vec()
  }

  /// Resize the emission ring, keeping the newest records.
  pub fn resize_emission_ring(&self, capacity: usize) {
    self.inner.ring.borrow_mut().resize(capacity);
  }

  /// When set, a panicking handler is logged and skipped instead of
  /// aborting the emission. Default off.
  pub fn set_fault_isolate(&self, fault_isolate: bool) {
    self.inner.fault_isolate.set(fault_isolate);
  }

  pub fn fault_isolate(&self) -> bool {
    self.inner.fault_isolate.get()
  }

  // ---------------------------------------------------------------------
  // Registration
  // ---------------------------------------------------------------------

  fn check_token(&self, token: &RegistrationToken) -> Result<()> {
    if Rc::ptr_eq(self.inner_rc(), token.bus().inner_rc()) {
      Ok(())
    } else {
      Err(BusError::OwnershipMismatch("token is bound to a different bus"))
    }
  }

  fn next_insertion(&self) -> u64 {
    let seq = self.inner.insertions.get();
    self.inner.insertions.set(seq + 1);
    seq
  }

  fn register_in<F: Clone + 'static>(
    &self,
    token: &RegistrationToken,
    list: &Rc<HandlerList<F>>,
    key: Option<Identity>,
    priority: i32,
    func: F,
  ) -> Result<(RegistrationHandle, Disposer)> {
    self.check_token(token)?;
    let handle = mint_handle();
    let key_alive = key.is_none_or(|key| !self.inner.dead.borrow().contains(&key));
    let state = EntryState::new(handle, token.is_enabled(), key_alive, token.core_weak());
    list.insert(HandlerEntry {
      state: Rc::clone(&state),
      priority,
      seq: self.next_insertion(),
      func,
    });
    let detach = {
      let list = Rc::clone(list);
      Box::new(move || {
        list.remove(handle);
      }) as Box<dyn Fn()>
    };
    self.inner.handles.borrow_mut().insert(handle, HandleSlot {
      state: Rc::clone(&state),
      detach,
    });
    if key_alive {
      if let Some(key) = key {
        self.inner.keyed.borrow_mut().entry(key).or_default().push(Rc::clone(&state));
      }
    }
    token.core().record(handle, state);
    log::trace!("registered {handle:?} (priority {priority})");
    Ok((handle, Disposer {
      bus: Rc::downgrade(&self.inner),
      handle,
    }))
  }

  fn require_key(key: Identity) -> Result<Identity> {
    if key.is_none() {
      Err(BusError::InvalidInput("addressing key must not be Identity::NONE"))
    } else {
      Ok(key)
    }
  }

  /// Register a handler for untargeted emissions of `M`.
  pub fn register_untargeted<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    handler: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: UntargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_source, msg: &M| handler(msg));
      self.register_in(token, &table.untargeted.normal, None, priority, func)
    })
  }

  /// Register a handler for emissions of `M` targeted at `target`.
  pub fn register_targeted<M, F>(
    &self,
    token: &RegistrationToken,
    target: Identity,
    priority: i32,
    handler: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(&M) + 'static,
  {
    let target = Self::require_key(target)?;
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_target, msg: &M| handler(msg));
      self.register_in(token, &table.targeted_for(target).normal, Some(target), priority, func)
    })
  }

  /// Register a handler observing every targeted emission of `M`,
  /// regardless of target.
  pub fn register_targeted_any<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    handler: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |target, msg: &M| handler(target, msg));
      self.register_in(token, &table.targeted_any.normal, None, priority, func)
    })
  }

  /// Register a handler for broadcasts of `M` from `source`.
  pub fn register_broadcast<M, F>(
    &self,
    token: &RegistrationToken,
    source: Identity,
    priority: i32,
    handler: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(&M) + 'static,
  {
    let source = Self::require_key(source)?;
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_source, msg: &M| handler(msg));
      self.register_in(token, &table.broadcast_for(source).normal, Some(source), priority, func)
    })
  }

  /// Register a handler observing every broadcast of `M`, regardless of
  /// source.
  pub fn register_broadcast_any<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    handler: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |source, msg: &M| handler(source, msg));
      self.register_in(token, &table.broadcast_any.normal, None, priority, func)
    })
  }

  /// Register an interceptor for untargeted emissions of `M`. Returning
  /// `false` cancels the emission.
  pub fn register_untargeted_interceptor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: UntargetedMessage,
    F: Fn(&M) -> bool + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |_source, msg: &M| interceptor(msg));
      self.register_in(token, &table.untargeted.interceptors, None, priority, func)
    })
  }

  /// Register a shape-global interceptor for targeted emissions of `M`.
  /// Runs before keyed and "any" interceptors.
  pub fn register_targeted_interceptor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |target, msg: &M| interceptor(target, msg));
      self.register_in(token, &table.targeted_shape_interceptors, None, priority, func)
    })
  }

  /// Register an interceptor for emissions of `M` targeted at `target`.
  pub fn register_targeted_interceptor_for<M, F>(
    &self,
    token: &RegistrationToken,
    target: Identity,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(&M) -> bool + 'static,
  {
    let target = Self::require_key(target)?;
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |_target, msg: &M| interceptor(msg));
      self.register_in(
        token,
        &table.targeted_for(target).interceptors,
        Some(target),
        priority,
        func,
      )
    })
  }

  /// Register an interceptor observing every targeted emission of `M`.
  /// Runs after shape-global and keyed interceptors.
  pub fn register_targeted_any_interceptor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |target, msg: &M| interceptor(target, msg));
      self.register_in(token, &table.targeted_any.interceptors, None, priority, func)
    })
  }

  /// Register a shape-global interceptor for broadcasts of `M`.
  pub fn register_broadcast_interceptor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |source, msg: &M| interceptor(source, msg));
      self.register_in(token, &table.broadcast_shape_interceptors, None, priority, func)
    })
  }

  /// Register an interceptor for broadcasts of `M` from `source`.
  pub fn register_broadcast_interceptor_for<M, F>(
    &self,
    token: &RegistrationToken,
    source: Identity,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(&M) -> bool + 'static,
  {
    let source = Self::require_key(source)?;
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |_source, msg: &M| interceptor(msg));
      self.register_in(
        token,
        &table.broadcast_for(source).interceptors,
        Some(source),
        priority,
        func,
      )
    })
  }

  /// Register an interceptor observing every broadcast of `M`.
  pub fn register_broadcast_any_interceptor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    interceptor: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) -> bool + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: InterceptFn<M> = Rc::new(move |source, msg: &M| interceptor(source, msg));
      self.register_in(token, &table.broadcast_any.interceptors, None, priority, func)
    })
  }

  /// Register a post-processor for untargeted emissions of `M`.
  pub fn register_untargeted_post_processor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    post: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: UntargetedMessage,
    F: Fn(&M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_source, msg: &M| post(msg));
      self.register_in(token, &table.untargeted.post, None, priority, func)
    })
  }

  /// Register a post-processor for emissions of `M` targeted at `target`.
  pub fn register_targeted_post_processor<M, F>(
    &self,
    token: &RegistrationToken,
    target: Identity,
    priority: i32,
    post: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(&M) + 'static,
  {
    let target = Self::require_key(target)?;
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_target, msg: &M| post(msg));
      self.register_in(token, &table.targeted_for(target).post, Some(target), priority, func)
    })
  }

  /// Register a post-processor observing every targeted emission of `M`.
  pub fn register_targeted_any_post_processor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    post: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: TargetedMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |target, msg: &M| post(target, msg));
      self.register_in(token, &table.targeted_any.post, None, priority, func)
    })
  }

  /// Register a post-processor for broadcasts of `M` from `source`.
  pub fn register_broadcast_post_processor<M, F>(
    &self,
    token: &RegistrationToken,
    source: Identity,
    priority: i32,
    post: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(&M) + 'static,
  {
    let source = Self::require_key(source)?;
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |_source, msg: &M| post(msg));
      self.register_in(token, &table.broadcast_for(source).post, Some(source), priority, func)
    })
  }

  /// Register a post-processor observing every broadcast of `M`.
  pub fn register_broadcast_any_post_processor<M, F>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    post: F,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    M: BroadcastMessage,
    F: Fn(Identity, &M) + 'static,
  {
    self.with_table::<M, _>(|table| {
      let func: NormalFn<M> = Rc::new(move |source, msg: &M| post(source, msg));
      self.register_in(token, &table.broadcast_any.post, None, priority, func)
    })
  }

  /// Register one observer of every emission on the bus, of every type and
  /// shape. The three callbacks correspond to the three dispatch shapes.
  pub fn register_global_accept_all<U, T, B>(
    &self,
    token: &RegistrationToken,
    priority: i32,
    untargeted: U,
    targeted: T,
    broadcast: B,
  ) -> Result<(RegistrationHandle, Disposer)>
  where
    U: Fn(&dyn Message) + 'static,
    T: Fn(Identity, &dyn Message) + 'static,
    B: Fn(Identity, &dyn Message) + 'static,
  {
    let funcs = AcceptAllFns {
      untargeted: Rc::new(untargeted),
      targeted:   Rc::new(targeted),
      broadcast:  Rc::new(broadcast),
    };
    let accept_all = Rc::clone(&self.inner.accept_all);
    self.register_in(token, &accept_all, None, priority, funcs)
  }

  // ---------------------------------------------------------------------
  // Emission
  // ---------------------------------------------------------------------

  /// Emit `msg` to every untargeted observer of its type.
  pub fn emit_untargeted<M: UntargetedMessage>(&self, msg: &M) {
    self.with_table::<M, _>(|table| self.run_untargeted(table, msg));
  }

  /// Emit `msg` to observers targeted at `target`.
  pub fn emit_targeted<M: TargetedMessage>(&self, target: Identity, msg: &M) {
    self.with_table::<M, _>(|table| self.run_targeted(table, target, msg));
  }

  /// Emit `msg` as a broadcast originating from `source`.
  pub fn emit_broadcast<M: BroadcastMessage>(&self, source: Identity, msg: &M) {
    self.with_table::<M, _>(|table| self.run_broadcast(table, source, msg));
  }

  /// Untargeted emission with the concrete type resolved at call time.
  pub fn emit_untargeted_dyn(&self, msg: &dyn Message) {
    match self.lookup_table(msg) {
      Some(table) => table.dispatch_untargeted(self, msg),
      None => self.run_unregistered(EmitKind::Untargeted, msg),
    }
  }

  /// Targeted emission with the concrete type resolved at call time.
  pub fn emit_targeted_dyn(&self, target: Identity, msg: &dyn Message) {
    match self.lookup_table(msg) {
      Some(table) => table.dispatch_targeted(self, target, msg),
      None => self.run_unregistered(EmitKind::Targeted(target), msg),
    }
  }

  /// Broadcast emission with the concrete type resolved at call time.
  pub fn emit_broadcast_dyn(&self, source: Identity, msg: &dyn Message) {
    match self.lookup_table(msg) {
      Some(table) => table.dispatch_broadcast(self, source, msg),
      None => self.run_unregistered(EmitKind::Broadcast(source), msg),
    }
  }

  fn lookup_table(&self, msg: &dyn Message) -> Option<Rc<dyn ErasedTable>> {
    let type_id = msg.as_any().type_id();
    self.inner.tables.borrow().get(&type_id).cloned()
  }

  pub(crate) fn run_untargeted<M: Message>(&self, table: &HandlerTable<M>, msg: &M) {
    self.run_pipeline(table, EmitKind::Untargeted, msg);
  }

  pub(crate) fn run_targeted<M: Message>(&self, table: &HandlerTable<M>, target: Identity, msg: &M) {
    self.run_pipeline(table, EmitKind::Targeted(target), msg);
  }

  pub(crate) fn run_broadcast<M: Message>(&self, table: &HandlerTable<M>, source: Identity, msg: &M) {
    self.run_pipeline(table, EmitKind::Broadcast(source), msg);
  }

  /// Handler table for `M`, created on first touch. The table's `Rc` is
  /// cloned out of the map before `f` runs, so handlers invoked downstream
  /// are free to register new types re-entrantly.
  fn with_table<M: Message, R>(&self, f: impl FnOnce(&HandlerTable<M>) -> R) -> R {
    let key = TypeId::of::<M>();
    let erased: Rc<dyn ErasedTable> = {
      let mut tables = self.inner.tables.borrow_mut();
      if !tables.contains_key(&key) {
        let index = type_index::<M>();
        log::trace!("first touch of message type {} -> {index:?}", std::any::type_name::<M>());
        let fresh: Rc<dyn ErasedTable> = Rc::new(HandlerTable::<M>::new());
        tables.insert(key, fresh);
      }
      Rc::clone(tables.get(&key).unwrap())
    };
    eprintln!("DEBUG with_table M={} expect={:?} actual={:?} key={:?} via_self={:?}", std::any::type_name::<M>(), TypeId::of::<HandlerTable<M>>(), erased.as_any().type_id(), key, (&*erased as &dyn std::any::Any).type_id());
    let table = erased
      .as_any()
      .downcast_ref::<HandlerTable<M>>()
      .expect("handler table stored under mismatched TypeId");
    f(table)
  }

  fn bump_emission(&self) -> i64 {
    let next = self.inner.emissions.get() + 1;
    self.inner.emissions.set(next);
    next
  }

  fn run_pipeline<M: Message>(&self, table: &HandlerTable<M>, kind: EmitKind, msg: &M) {
    let sequence = self.bump_emission();
    let mode = crate::globals::diagnostics_mode();
    let type_index = type_index::<M>();
    let type_name = msg.type_name();
    let context = kind.context();

    if let Some(key) = context {
      if !self.is_alive(key) {
        // Dead addressing key: no observer matched. Not an error.
        log::trace!("dropping {type_name} emission #{sequence}: {key} is not alive");
        self.record_emission(mode, type_index, type_name, context, sequence, EmissionOutcome::Completed);
        return;
      }
    }

    let ctx = InvocationCtx {
      sequence,
      type_index,
      type_name,
      context,
      token_diag: mode.token_enabled(),
    };
    let fault_isolate = self.inner.fault_isolate.get();
    let deliver = || self.deliver(table, kind, msg, &ctx, fault_isolate);

    let outcome = if !fault_isolate && mode.bus_enabled() {
      // Catch only to record the fault, then let it keep unwinding.
      match catch_unwind(AssertUnwindSafe(deliver)) {
        Ok(outcome) => outcome,
        Err(payload) => {
          self.record_emission(mode, type_index, type_name, context, sequence, EmissionOutcome::Faulted);
          resume_unwind(payload);
        },
      }
    } else {
      deliver()
    };

    self.record_emission(mode, type_index, type_name, context, sequence, outcome);
  }

  fn deliver<M: Message>(
    &self,
    table: &HandlerTable<M>,
    kind: EmitKind,
    msg: &M,
    ctx: &InvocationCtx,
    fault_isolate: bool,
  ) -> EmissionOutcome {
    let source = kind.source();

    // Every list this emission may iterate is snapshotted before anything
    // runs. A handler registered anywhere during this emission therefore
    // never fires during it, post-processors included.
    let mut levels: SmallVec<[Snapshot<InterceptFn<M>>; 3]> = SmallVec::new();
    match kind {
      EmitKind::Untargeted => levels.push(table.untargeted.interceptors.snapshot()),
      EmitKind::Targeted(key) => {
        levels.push(table.targeted_shape_interceptors.snapshot());
        if let Some(lists) = table.targeted_lists(key) {
          levels.push(lists.interceptors.snapshot());
        }
        levels.push(table.targeted_any.interceptors.snapshot());
      },
      EmitKind::Broadcast(key) => {
        levels.push(table.broadcast_shape_interceptors.snapshot());
        if let Some(lists) = table.broadcast_lists(key) {
          levels.push(lists.interceptors.snapshot());
        }
        levels.push(table.broadcast_any.interceptors.snapshot());
      },
    }
    let normal_block = merge_block(table, kind, HandlerKind::Normal);
    let accept_all = self.inner.accept_all.snapshot();
    let post_block = merge_block(table, kind, HandlerKind::PostProcessor);

    // Interceptor levels in fixed order: shape-global, keyed, any. Each
    // level is its own priority-sorted list; the first cancel wins.
    for level in &levels {
      for entry in level.iter() {
        if !entry.state.active() {
          continue;
        }
        self.note_invocation(ctx, &entry.state);
        let allowed = if fault_isolate {
          match catch_unwind(AssertUnwindSafe(|| (*entry.func)(source, msg))) {
            Ok(allowed) => allowed,
            Err(_) => {
              log::error!("interceptor fault isolated during {} emission #{}", ctx.type_name, ctx.sequence);
              true
            },
          }
        } else {
          (*entry.func)(source, msg)
        };
        if !allowed {
          log::trace!("{} emission #{} cancelled by interceptor", ctx.type_name, ctx.sequence);
          return EmissionOutcome::Cancelled;
        }
      }
    }

    // Normal handlers: the keyed and "any" lists interleaved by
    // (priority, list origin, insertion sequence).
    for entry in normal_block {
      if !entry.state.active() {
        continue;
      }
      self.note_invocation(ctx, &entry.state);
      self.call_guarded(fault_isolate, ctx, || (*entry.func)(source, msg));
    }

    // Accept-all observers run after the per-shape lists, as their own
    // priority-sorted block.
    self.invoke_accept_all(&accept_all, ctx, kind, msg, fault_isolate);

    // Post-processors mirror the normal ordering over their own lists, and
    // run exactly once per emission.
    for entry in post_block {
      if !entry.state.active() {
        continue;
      }
      self.note_invocation(ctx, &entry.state);
      self.call_guarded(fault_isolate, ctx, || (*entry.func)(source, msg));
    }

    EmissionOutcome::Completed
  }

  /// Emission of a type no registration ever touched: only accept-all
  /// observers can match, but the emission still gets a sequence id and a
  /// diagnostic record.
  fn run_unregistered(&self, kind: EmitKind, msg: &dyn Message) {
    let sequence = self.bump_emission();
    let mode = crate::globals::diagnostics_mode();
    let type_index = type_index_of(msg.as_any().type_id());
    let type_name = msg.type_name();
    let context = kind.context();

    if let Some(key) = context {
      if !self.is_alive(key) {
        self.record_emission(mode, type_index, type_name, context, sequence, EmissionOutcome::Completed);
        return;
      }
    }

    let ctx = InvocationCtx {
      sequence,
      type_index,
      type_name,
      context,
      token_diag: mode.token_enabled(),
    };
    let fault_isolate = self.inner.fault_isolate.get();

    if !fault_isolate && mode.bus_enabled() {
      match catch_unwind(AssertUnwindSafe(|| self.run_accept_all(&ctx, kind, msg, fault_isolate))) {
        Ok(()) => {},
        Err(payload) => {
          self.record_emission(mode, type_index, type_name, context, sequence, EmissionOutcome::Faulted);
          resume_unwind(payload);
        },
      }
    } else {
      self.run_accept_all(&ctx, kind, msg, fault_isolate);
    }

    self.record_emission(mode, type_index, type_name, context, sequence, EmissionOutcome::Completed);
  }

  fn run_accept_all(&self, ctx: &InvocationCtx, kind: EmitKind, msg: &dyn Message, fault_isolate: bool) {
    let snapshot = self.inner.accept_all.snapshot();
    self.invoke_accept_all(&snapshot, ctx, kind, msg, fault_isolate);
  }

  fn invoke_accept_all(
    &self,
    snapshot: &Snapshot<AcceptAllFns>,
    ctx: &InvocationCtx,
    kind: EmitKind,
    msg: &dyn Message,
    fault_isolate: bool,
  ) {
    for entry in snapshot.iter() {
      if !entry.state.active() {
        continue;
      }
      self.note_invocation(ctx, &entry.state);
      let funcs = entry.func.clone();
      self.call_guarded(fault_isolate, ctx, || match kind {
        EmitKind::Untargeted => (*funcs.untargeted)(msg),
        EmitKind::Targeted(key) => (*funcs.targeted)(key, msg),
        EmitKind::Broadcast(key) => (*funcs.broadcast)(key, msg),
      });
    }
  }

  fn call_guarded(&self, fault_isolate: bool, ctx: &InvocationCtx, f: impl FnOnce()) {
    if fault_isolate {
      if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("handler fault isolated during {} emission #{}", ctx.type_name, ctx.sequence);
      }
    } else {
      f();
    }
  }

  fn note_invocation(&self, ctx: &InvocationCtx, state: &EntryState) {
    if !ctx.token_diag {
      return;
    }
    if let Some(core) = state.owner.upgrade() {
      core.note_invocation(state.handle, ctx);
    }
  }

  fn record_emission(
    &self,
    mode: DiagnosticsMode,
    type_index: MessageTypeIndex,
    type_name: &'static str,
    context: Option<Identity>,
    sequence: i64,
    outcome: EmissionOutcome,
  ) {
    if !mode.bus_enabled() {
      return;
    }
    self.inner.ring.borrow_mut().push(EmissionRecord {
      type_index,
      type_name,
      context,
      stack: capture_stack(),
      timestamp: SystemTime::now(),
      sequence,
      outcome,
    });
  }
}

/// Merged view of the normal (or post-processor) lists an emission must
/// walk, in invocation order.
fn merge_block<M: Message>(
  table: &HandlerTable<M>,
  kind: EmitKind,
  block: HandlerKind,
) -> OrderedMerge<NormalFn<M>> {
  let pick = |lists: &KindLists<M>| match block {
    HandlerKind::PostProcessor => lists.post.snapshot(),
    _ => lists.normal.snapshot(),
  };
  let mut lists: SmallVec<[(Snapshot<NormalFn<M>>, u8); 2]> = SmallVec::new();
  match kind {
    EmitKind::Untargeted => lists.push((pick(&table.untargeted), 0)),
    EmitKind::Targeted(key) => {
      if let Some(keyed) = table.targeted_lists(key) {
        lists.push((pick(&keyed), 0));
      }
      lists.push((pick(&table.targeted_any), 1));
    },
    EmitKind::Broadcast(key) => {
      if let Some(keyed) = table.broadcast_lists(key) {
        lists.push((pick(&keyed), 0));
      }
      lists.push((pick(&table.broadcast_any), 1));
    },
  }
  OrderedMerge::new(lists)
}
