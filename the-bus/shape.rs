/// Addressing shape of a registration or emission.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DispatchShape {
  /// Global event, no addressing key.
  Untargeted,
  /// Addressed *to* a specific identity.
  Targeted,
  /// Observes every targeted emission of the type, regardless of key.
  TargetedAny,
  /// Originating *from* a specific identity.
  Broadcast,
  /// Observes every broadcast emission of the type, regardless of key.
  BroadcastAny,
  /// Observes every emission of every type on the bus.
  GlobalAcceptAll,
}

/// Pipeline role of a registered handler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum HandlerKind {
  /// Runs in the main delivery block.
  Normal,
  /// Runs before normal handlers and may cancel the emission.
  Interceptor,
  /// Runs after all normal handlers of an emission.
  PostProcessor,
}
