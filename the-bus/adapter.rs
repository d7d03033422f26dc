use crate::identity::Identity;

/// Liveness oracle supplied by the host engine.
///
/// The bus tracks identities it was explicitly told about via
/// `MessageBus::deactivate`; an adapter lets the host answer for everything
/// else (e.g. an entity that was despawned without ever touching the bus).
/// Targeted and broadcast emissions whose addressing key is not alive are
/// dropped silently, as if no observer matched.
pub trait HostAdapter {
  fn is_alive(&self, identity: Identity) -> bool;
}

/// Default adapter: every identity the bus was not told is dead counts as
/// alive.
pub struct AlwaysAlive;

impl HostAdapter for AlwaysAlive {
  fn is_alive(&self, _identity: Identity) -> bool {
    true
  }
}
