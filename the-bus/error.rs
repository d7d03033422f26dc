use thiserror::Error;

/// Errors surfaced by registration and token operations.
///
/// Runtime dispatch never returns these: a destroyed addressing key is a
/// silent no-match, interceptor cancellation is not an error, and handler
/// faults follow the bus fault policy (see `MessageBus::set_fault_isolate`).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
  #[error("invalid input: {0}")]
  InvalidInput(&'static str),

  #[error("ownership mismatch: {0}")]
  OwnershipMismatch(&'static str),
}

pub type Result<T> = std::result::Result<T, BusError>;
