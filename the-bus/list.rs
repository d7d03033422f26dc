//! Priority-ordered handler lists with copy-on-write snapshots.
//!
//! A list's backing storage is an immutable `Rc<Vec<_>>`. An emission that
//! touches a list clones the `Rc` once (the snapshot); structural mutation
//! clones the vector and swaps the `Rc`, leaving live snapshots untouched.
//! Removal and deactivation additionally flip shared activation bits that
//! snapshots honor at call time, so an entry revoked mid-emission is skipped
//! even though it is still present in an already-bound snapshot.

use std::{
  cell::{
    Cell,
    RefCell,
  },
  rc::{
    Rc,
    Weak,
  },
};

use smallvec::SmallVec;

use crate::{
  handle::RegistrationHandle,
  token::TokenCore,
};

/// Activation state shared between a handler entry, its owning token, and
/// the bus handle map.
///
/// `active` decomposes into three independently flipped bits so the token
/// (enable/disable), the bus (removal), and the lifecycle adapter
/// (deactivation of an addressing key) never have to coordinate.
pub(crate) struct EntryState {
  pub handle: RegistrationHandle,
  enabled:    Cell<bool>,
  removed:    Cell<bool>,
  key_alive:  Cell<bool>,
  pub owner:  Weak<TokenCore>,
}

impl EntryState {
  pub fn new(
    handle: RegistrationHandle,
    enabled: bool,
    key_alive: bool,
    owner: Weak<TokenCore>,
  ) -> Rc<Self> {
    Rc::new(EntryState {
      handle,
      enabled: Cell::new(enabled),
      removed: Cell::new(false),
      key_alive: Cell::new(key_alive),
      owner,
    })
  }

  pub fn active(&self) -> bool {
    self.enabled.get() && !self.removed.get() && self.key_alive.get()
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.enabled.set(enabled);
  }

  pub fn mark_removed(&self) {
    self.removed.set(true);
  }

  pub fn is_removed(&self) -> bool {
    self.removed.get()
  }

  /// Called when the entry's addressing key is destroyed. Never undone.
  pub fn kill_key(&self) {
    self.key_alive.set(false);
  }
}

/// One registered handler, as stored in a list.
pub(crate) struct HandlerEntry<F> {
  pub state:    Rc<EntryState>,
  pub priority: i32,
  pub seq:      u64,
  pub func:     F,
}

impl<F: Clone> Clone for HandlerEntry<F> {
  fn clone(&self) -> Self {
    HandlerEntry {
      state:    Rc::clone(&self.state),
      priority: self.priority,
      seq:      self.seq,
      func:     self.func.clone(),
    }
  }
}

/// An emission's frozen view of one list.
pub(crate) type Snapshot<F> = Rc<Vec<HandlerEntry<F>>>;

/// A handler list for one (shape, addressing key, kind) bucket.
pub(crate) struct HandlerList<F> {
  entries: RefCell<Snapshot<F>>,
}

impl<F: Clone> HandlerList<F> {
  pub fn new() -> Rc<Self> {
    Rc::new(HandlerList {
      entries: RefCell::new(Rc::new(Vec::new())),
    })
  }

  /// Bind a frozen view of the current contents. O(1).
  pub fn snapshot(&self) -> Snapshot<F> {
    Rc::clone(&self.entries.borrow())
  }

  pub fn len(&self) -> usize {
    self.entries.borrow().len()
  }

  /// Insert at the position dictated by (priority, insertion sequence).
  ///
  /// Copy-on-write: emissions already holding a snapshot do not observe the
  /// new entry; the next snapshot does.
  pub fn insert(&self, entry: HandlerEntry<F>) {
    let mut slot = self.entries.borrow_mut();
    let position = slot
      .partition_point(|existing| (existing.priority, existing.seq) < (entry.priority, entry.seq));
    let mut next: Vec<HandlerEntry<F>> = Vec::with_capacity(slot.len() + 1);
    next.extend(slot[..position].iter().cloned());
    next.push(entry);
    next.extend(slot[position..].iter().cloned());
    *slot = Rc::new(next);
  }

  /// Structurally remove the entry for `handle`, if present.
  ///
  /// Live snapshots keep the entry but skip it via its activation state.
  pub fn remove(&self, handle: RegistrationHandle) -> bool {
    let mut slot = self.entries.borrow_mut();
    let Some(position) = slot.iter().position(|entry| entry.state.handle == handle) else {
      return false;
    };
    let mut next: Vec<HandlerEntry<F>> = Vec::with_capacity(slot.len() - 1);
    next.extend(slot[..position].iter().cloned());
    next.extend(slot[position + 1..].iter().cloned());
    *slot = Rc::new(next);
    true
  }
}

/// Interleaves several snapshots by (priority, list origin, insertion
/// sequence), yielding entries in the order the pipeline must invoke them.
///
/// Origin ranks encode the fixed relative order of lists within one block:
/// the addressing-key list before the "any" list.
pub(crate) struct OrderedMerge<F> {
  lists:   SmallVec<[(Snapshot<F>, u8); 2]>,
  cursors: SmallVec<[usize; 2]>,
}

impl<F: Clone> OrderedMerge<F> {
  pub fn new(lists: impl IntoIterator<Item = (Snapshot<F>, u8)>) -> Self {
    let lists: SmallVec<[(Snapshot<F>, u8); 2]> = lists.into_iter().collect();
    let cursors = lists.iter().map(|_| 0).collect();
    OrderedMerge { lists, cursors }
  }
}

impl<F: Clone> Iterator for OrderedMerge<F> {
  type Item = HandlerEntry<F>;

  fn next(&mut self) -> Option<HandlerEntry<F>> {
    let mut best: Option<(usize, (i32, u8, u64))> = None;
    for (index, (snapshot, origin)) in self.lists.iter().enumerate() {
      let cursor = self.cursors[index];
      let Some(entry) = snapshot.get(cursor) else {
        continue;
      };
      let key = (entry.priority, *origin, entry.seq);
      if best.is_none_or(|(_, best_key)| key < best_key) {
        best = Some((index, key));
      }
    }
    let (index, _) = best?;
    let entry = self.lists[index].0[self.cursors[index]].clone();
    self.cursors[index] += 1;
    Some(entry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(priority: i32, seq: u64) -> HandlerEntry<u32> {
    HandlerEntry {
      state: EntryState::new(crate::handle::mint_handle(), true, true, Weak::new()),
      priority,
      seq,
      func: seq as u32,
    }
  }

  #[test]
  fn insert_keeps_priority_then_sequence_order() {
    let list = HandlerList::new();
    list.insert(entry(0, 1));
    list.insert(entry(-5, 2));
    list.insert(entry(0, 3));
    list.insert(entry(7, 4));

    let order: Vec<u64> = list.snapshot().iter().map(|e| e.seq).collect();
    assert_eq!(order, vec![2, 1, 3, 4]);
  }

  #[test]
  fn snapshot_is_immune_to_later_mutation() {
    let list = HandlerList::new();
    list.insert(entry(0, 1));
    let snapshot = list.snapshot();
    list.insert(entry(0, 2));

    assert_eq!(snapshot.len(), 1);
    assert_eq!(list.snapshot().len(), 2);
  }

  #[test]
  fn removal_leaves_live_snapshots_intact() {
    let list = HandlerList::new();
    let first = entry(0, 1);
    let handle = first.state.handle;
    list.insert(first);
    list.insert(entry(0, 2));

    let snapshot = list.snapshot();
    assert!(list.remove(handle));
    assert!(!list.remove(handle));

    assert_eq!(snapshot.len(), 2);
    assert_eq!(list.len(), 1);
  }

  #[test]
  fn merge_interleaves_by_priority_then_origin() {
    let keyed = HandlerList::new();
    keyed.insert(entry(0, 10));
    keyed.insert(entry(5, 11));
    let any = HandlerList::new();
    any.insert(entry(-1, 12));
    any.insert(entry(0, 13));

    let order: Vec<u64> = OrderedMerge::new([(keyed.snapshot(), 0), (any.snapshot(), 1)])
      .map(|e| e.seq)
      .collect();
    // Priority first; at equal priority the keyed list (origin 0) wins.
    assert_eq!(order, vec![12, 10, 13, 11]);
  }
}
