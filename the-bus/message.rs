use std::any::Any;

/// Base trait for anything that can travel through the bus.
///
/// Blanket-implemented for every `'static` type; the bus routes by the
/// message's concrete type, never by an interface it happens to implement.
/// The dispatch-shape marker traits below opt a type into the corresponding
/// typed emit entry points.
pub trait Message: Any {
  /// The message as `Any`, for the dynamic dispatch paths.
  fn as_any(&self) -> &dyn Any;

  /// Human-readable concrete type name, used by diagnostics.
  fn type_name(&self) -> &'static str;
}

impl<T: Any> Message for T {
  fn as_any(&self) -> &dyn Any {
    self
  }

  fn type_name(&self) -> &'static str {
    std::any::type_name::<T>()
  }
}

/// Marker for messages emitted without a target (global events).
pub trait UntargetedMessage: Message {}

/// Marker for messages addressed *to* an entity identity.
pub trait TargetedMessage: Message {}

/// Marker for messages originating *from* an entity identity.
pub trait BroadcastMessage: Message {}
