use std::fmt;

/// Opaque identity of a message target or source.
///
/// Identities are minted by the host (an entity id, a component id, a hash of
/// either); the bus never creates them and never looks inside. Equality and
/// hashing are defined over the raw bits, and `0` is reserved as the "none"
/// identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl Identity {
  /// The reserved "no identity" value.
  pub const NONE: Identity = Identity(0);

  pub const fn from_raw(raw: u64) -> Self {
    Identity(raw)
  }

  pub const fn raw(self) -> u64 {
    self.0
  }

  pub const fn is_none(self) -> bool {
    self.0 == 0
  }

  pub const fn is_some(self) -> bool {
    self.0 != 0
  }
}

impl fmt::Debug for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_none() {
      write!(f, "Identity(none)")
    } else {
      write!(f, "Identity({})", self.0)
    }
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

impl From<u64> for Identity {
  fn from(raw: u64) -> Self {
    Identity(raw)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn none_is_reserved() {
    assert!(Identity::NONE.is_none());
    assert!(!Identity::NONE.is_some());
    assert_eq!(Identity::from_raw(0), Identity::NONE);
  }

  #[test]
  fn equality_is_over_raw_bits() {
    let a = Identity::from_raw(17);
    let b = Identity::from_raw(17);
    let c = Identity::from_raw(18);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.raw(), 17);
  }
}
