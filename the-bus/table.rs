//! Per-message-type handler tables.
//!
//! One [`HandlerTable`] exists per concrete message type ever registered or
//! emitted on a bus. It owns every handler list for that type, keyed by
//! (shape, addressing key, kind). The table is the dispatch hot path: lookups
//! clone `Rc`s and never hold a borrow across handler invocation, so handlers
//! are free to register, remove, and emit re-entrantly.

use std::{
  any::Any,
  cell::RefCell,
  rc::Rc,
};

use hashbrown::HashMap;

use crate::{
  bus::MessageBus,
  identity::Identity,
  list::HandlerList,
  message::Message,
  shape::{
    DispatchShape,
    HandlerKind,
  },
};

/// Stored form of a normal handler or post-processor.
///
/// The identity argument is the addressing key of the emission
/// (`Identity::NONE` for untargeted); wrappers for keyed registrations
/// ignore it.
pub(crate) type NormalFn<M> = Rc<dyn Fn(Identity, &M)>;

/// Stored form of an interceptor. Returning `false` cancels the emission.
pub(crate) type InterceptFn<M> = Rc<dyn Fn(Identity, &M) -> bool>;

/// The three kind lists of one (shape, addressing key) bucket.
pub(crate) struct KindLists<M: 'static> {
  pub normal:       Rc<HandlerList<NormalFn<M>>>,
  pub interceptors: Rc<HandlerList<InterceptFn<M>>>,
  pub post:         Rc<HandlerList<NormalFn<M>>>,
}

impl<M: 'static> KindLists<M> {
  fn new() -> Self {
    KindLists {
      normal:       HandlerList::new(),
      interceptors: HandlerList::new(),
      post:         HandlerList::new(),
    }
  }

  pub fn count(&self, kind: HandlerKind) -> usize {
    match kind {
      HandlerKind::Normal => self.normal.len(),
      HandlerKind::Interceptor => self.interceptors.len(),
      HandlerKind::PostProcessor => self.post.len(),
    }
  }
}

impl<M: 'static> Clone for KindLists<M> {
  fn clone(&self) -> Self {
    KindLists {
      normal:       Rc::clone(&self.normal),
      interceptors: Rc::clone(&self.interceptors),
      post:         Rc::clone(&self.post),
    }
  }
}

/// All handler lists for one concrete message type.
pub(crate) struct HandlerTable<M: 'static> {
  pub untargeted:    KindLists<M>,
  pub targeted_any:  KindLists<M>,
  pub broadcast_any: KindLists<M>,
  /// Shape-global interceptors: run before keyed and "any" interceptors for
  /// every targeted emission of the type.
  pub targeted_shape_interceptors:  Rc<HandlerList<InterceptFn<M>>>,
  /// Shape-global interceptors for broadcast emissions.
  pub broadcast_shape_interceptors: Rc<HandlerList<InterceptFn<M>>>,
  targeted:  RefCell<HashMap<Identity, KindLists<M>>>,
  broadcast: RefCell<HashMap<Identity, KindLists<M>>>,
}

impl<M: 'static> HandlerTable<M> {
  pub fn new() -> Self {
    HandlerTable {
      untargeted:    KindLists::new(),
      targeted_any:  KindLists::new(),
      broadcast_any: KindLists::new(),
      targeted_shape_interceptors:  HandlerList::new(),
      broadcast_shape_interceptors: HandlerList::new(),
      targeted:  RefCell::new(HashMap::new()),
      broadcast: RefCell::new(HashMap::new()),
    }
  }

  /// Bucket for registrations targeted at `key`, created on first use.
  pub fn targeted_for(&self, key: Identity) -> KindLists<M> {
    self
      .targeted
      .borrow_mut()
      .entry(key)
      .or_insert_with(KindLists::new)
      .clone()
  }

  /// Bucket for registrations listening to broadcasts from `key`.
  pub fn broadcast_for(&self, key: Identity) -> KindLists<M> {
    self
      .broadcast
      .borrow_mut()
      .entry(key)
      .or_insert_with(KindLists::new)
      .clone()
  }

  /// Bucket for an emission targeted at `key`, if any registration created
  /// one. Emissions never create buckets.
  pub fn targeted_lists(&self, key: Identity) -> Option<KindLists<M>> {
    self.targeted.borrow().get(&key).cloned()
  }

  pub fn broadcast_lists(&self, key: Identity) -> Option<KindLists<M>> {
    self.broadcast.borrow().get(&key).cloned()
  }

  pub fn count_of(&self, shape: DispatchShape, kind: HandlerKind) -> usize {
    match shape {
      DispatchShape::Untargeted => self.untargeted.count(kind),
      DispatchShape::TargetedAny => self.targeted_any.count(kind),
      DispatchShape::BroadcastAny => self.broadcast_any.count(kind),
      DispatchShape::Targeted => {
        let keyed: usize = self.targeted.borrow().values().map(|lists| lists.count(kind)).sum();
        let shape_global = if kind == HandlerKind::Interceptor {
          self.targeted_shape_interceptors.len()
        } else {
          0
        };
        keyed + shape_global
      },
      DispatchShape::Broadcast => {
        let keyed: usize = self.broadcast.borrow().values().map(|lists| lists.count(kind)).sum();
        let shape_global = if kind == HandlerKind::Interceptor {
          self.broadcast_shape_interceptors.len()
        } else {
          0
        };
        keyed + shape_global
      },
      DispatchShape::GlobalAcceptAll => 0,
    }
  }
}

/// Type-erased view of a table, for the dynamic emit paths and counting.
pub(crate) trait ErasedTable: Any {
  fn as_any(&self) -> &dyn Any;
  fn dispatch_untargeted(&self, bus: &MessageBus, msg: &dyn Message);
  fn dispatch_targeted(&self, bus: &MessageBus, key: Identity, msg: &dyn Message);
  fn dispatch_broadcast(&self, bus: &MessageBus, key: Identity, msg: &dyn Message);
  fn count_of_erased(&self, shape: DispatchShape, kind: HandlerKind) -> usize;
}

impl<M: 'static> ErasedTable for HandlerTable<M> {
  fn as_any(&self) -> &dyn Any {
    self
  }

  fn dispatch_untargeted(&self, bus: &MessageBus, msg: &dyn Message) {
    match msg.as_any().downcast_ref::<M>() {
      Some(msg) => bus.run_untargeted(self, msg),
      None => log::error!("dynamic untargeted emission type mismatch for {}", msg.type_name()),
    }
  }

  fn dispatch_targeted(&self, bus: &MessageBus, key: Identity, msg: &dyn Message) {
    match msg.as_any().downcast_ref::<M>() {
      Some(msg) => bus.run_targeted(self, key, msg),
      None => log::error!("dynamic targeted emission type mismatch for {}", msg.type_name()),
    }
  }

  fn dispatch_broadcast(&self, bus: &MessageBus, key: Identity, msg: &dyn Message) {
    match msg.as_any().downcast_ref::<M>() {
      Some(msg) => bus.run_broadcast(self, key, msg),
      None => log::error!("dynamic broadcast emission type mismatch for {}", msg.type_name()),
    }
  }

  fn count_of_erased(&self, shape: DispatchShape, kind: HandlerKind) -> usize {
    self.count_of(shape, kind)
  }
}
