//! Dense, process-wide indices for message types.
//!
//! Every concrete message type observed by any bus gets a stable `u32` index
//! at first touch. Indices are monotonically assigned, never reused, and
//! deliberately survive [`crate::reset`]: diagnostics recorded before a reset
//! stay interpretable afterwards.

use std::{
  any::{
    Any,
    TypeId,
  },
  fmt,
};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Dense index of a message type, assigned at first observation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageTypeIndex(u32);

impl MessageTypeIndex {
  pub const fn raw(self) -> u32 {
    self.0
  }
}

impl fmt::Debug for MessageTypeIndex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "MessageTypeIndex({})", self.0)
  }
}

struct TypeIndexTable {
  by_type: HashMap<TypeId, MessageTypeIndex, foldhash::fast::FixedState>,
  next:    u32,
}

// The one piece of state shared across threads: the index assignment must be
// stable for the process lifetime, independent of which thread first saw the
// type.
static TABLE: Lazy<RwLock<TypeIndexTable>> = Lazy::new(|| {
  RwLock::new(TypeIndexTable {
    by_type: HashMap::default(),
    next:    0,
  })
});

/// Index of the concrete type `M`, assigning one on first touch.
pub fn type_index<M: Any>() -> MessageTypeIndex {
  type_index_of(TypeId::of::<M>())
}

/// Index for a runtime `TypeId`, assigning one on first touch.
pub fn type_index_of(type_id: TypeId) -> MessageTypeIndex {
  if let Some(index) = TABLE.read().by_type.get(&type_id) {
    return *index;
  }

  let mut table = TABLE.write();
  // Another thread may have assigned it between the read and write locks.
  if let Some(index) = table.by_type.get(&type_id) {
    return *index;
  }

  let index = MessageTypeIndex(table.next);
  table.next += 1;
  table.by_type.insert(type_id, index);
  index
}

/// Total number of message types observed so far, process-wide.
pub fn observed_type_count() -> u32 {
  TABLE.read().next
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Alpha;
  struct Beta;

  #[test]
  fn indices_are_stable_and_injective() {
    let a1 = type_index::<Alpha>();
    let b1 = type_index::<Beta>();
    assert_ne!(a1, b1);

    let a2 = type_index::<Alpha>();
    let b2 = type_index::<Beta>();
    assert_eq!(a1, a2);
    assert_eq!(b1, b2);
  }

  #[test]
  fn runtime_lookup_matches_static_lookup() {
    let by_type = type_index::<Alpha>();
    let by_id = type_index_of(TypeId::of::<Alpha>());
    assert_eq!(by_type, by_id);
  }

  #[test]
  fn count_covers_every_assigned_index() {
    let a = type_index::<Alpha>();
    let b = type_index::<Beta>();
    let count = observed_type_count();
    assert!(count > a.raw());
    assert!(count > b.raw());
  }
}
