//! Emission diagnostics: what ran, when, and how it ended.
//!
//! Diagnostics are opt-in (see [`crate::set_diagnostics_mode`]) because the
//! per-emission stack capture is far too expensive for a release hot path.
//! When enabled, the bus appends one [`EmissionRecord`] per emission to its
//! ring, and tokens additionally count and record every handler invocation
//! that went through them.

use std::{
  backtrace::Backtrace,
  time::SystemTime,
};

use crate::{
  identity::Identity,
  type_index::MessageTypeIndex,
};

/// Which diagnostic sinks are active.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DiagnosticsMode {
  /// No capture anywhere. The default.
  #[default]
  Off,
  /// Per-bus emission ring only.
  Bus,
  /// Per-token invocation counters and rings only.
  Token,
  /// Both sinks.
  All,
}

impl DiagnosticsMode {
  pub fn bus_enabled(self) -> bool {
    matches!(self, DiagnosticsMode::Bus | DiagnosticsMode::All)
  }

  pub fn token_enabled(self) -> bool {
    matches!(self, DiagnosticsMode::Token | DiagnosticsMode::All)
  }

  pub fn is_off(self) -> bool {
    self == DiagnosticsMode::Off
  }
}

/// How an emission ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EmissionOutcome {
  /// The full pipeline ran (possibly with isolated faults, see
  /// `MessageBus::set_fault_isolate`).
  Completed,
  /// An interceptor vetoed delivery.
  Cancelled,
  /// A handler fault aborted the emission.
  Faulted,
}

/// One recorded emission.
#[derive(Clone, Debug)]
pub struct EmissionRecord {
  /// Dense index of the emitted message type.
  pub type_index: MessageTypeIndex,
  /// Concrete type name of the emitted message.
  pub type_name:  &'static str,
  /// Addressing key for targeted/broadcast emissions.
  pub context:    Option<Identity>,
  /// Call stack at emission time, with bus-internal frames filtered out.
  pub stack:      Option<String>,
  /// Wall-clock time of the emission.
  pub timestamp:  SystemTime,
  /// Per-bus sequence id of the emission.
  pub sequence:   i64,
  pub outcome:    EmissionOutcome,
}

/// Capture the current call stack, dropping the bus' own frames.
pub(crate) fn capture_stack() -> Option<String> {
  let raw = Backtrace::force_capture().to_string();
  let mut filtered = String::with_capacity(raw.len());
  let mut skipping = false;
  for line in raw.lines() {
    let trimmed = line.trim_start();
    let is_location = trimmed.starts_with("at ");
    if is_location {
      if skipping {
        continue;
      }
    } else {
      skipping = is_internal_frame(trimmed);
      if skipping {
        continue;
      }
    }
    filtered.push_str(line);
    filtered.push('\n');
  }
  if filtered.is_empty() {
    None
  } else {
    Some(filtered)
  }
}

fn is_internal_frame(frame: &str) -> bool {
  frame.contains("the_bus::") || frame.contains("backtrace::")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mode_flags() {
    assert!(DiagnosticsMode::Off.is_off());
    assert!(DiagnosticsMode::Bus.bus_enabled());
    assert!(!DiagnosticsMode::Bus.token_enabled());
    assert!(DiagnosticsMode::Token.token_enabled());
    assert!(DiagnosticsMode::All.bus_enabled());
    assert!(DiagnosticsMode::All.token_enabled());
  }

  #[test]
  fn stack_capture_filters_internal_frames() {
    if let Some(stack) = capture_stack() {
      assert!(!stack.contains("the_bus::bus::"));
    }
  }
}
