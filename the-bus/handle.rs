use std::{
  cell::Cell,
  fmt,
};

/// Opaque identifier of a single registered handler entry.
///
/// Handles are dense integers minted by a monotonic thread-local counter;
/// `0` is the invalid sentinel. [`crate::reset`] restarts the counter, so the
/// first post-reset handle equals the first handle ever minted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
  /// The "no registration" sentinel.
  pub const INVALID: RegistrationHandle = RegistrationHandle(0);

  pub const fn raw(self) -> u64 {
    self.0
  }

  pub const fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl fmt::Debug for RegistrationHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_valid() {
      write!(f, "RegistrationHandle({})", self.0)
    } else {
      write!(f, "RegistrationHandle(invalid)")
    }
  }
}

thread_local! {
  static NEXT_HANDLE: Cell<u64> = const { Cell::new(1) };
}

/// Mint the next registration handle.
pub(crate) fn mint_handle() -> RegistrationHandle {
  NEXT_HANDLE.with(|next| {
    let value = next.get();
    next.set(value + 1);
    RegistrationHandle(value)
  })
}

/// Restart the handle counter. Part of [`crate::reset`].
pub(crate) fn reset_handle_counter() {
  NEXT_HANDLE.with(|next| next.set(1));
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn handles_are_distinct_and_valid() {
    let a = mint_handle();
    let b = mint_handle();
    assert_ne!(a, b);
    assert!(a.is_valid());
    assert!(b.is_valid());
    assert!(!RegistrationHandle::INVALID.is_valid());
  }

  #[test]
  fn reset_restarts_the_counter() {
    reset_handle_counter();
    let first = mint_handle();
    let _ = mint_handle();
    reset_handle_counter();
    assert_eq!(mint_handle(), first);
  }
}
