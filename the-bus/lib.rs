//! # the-bus
//!
//! An in-process, strongly-typed publish/subscribe dispatcher for
//! game-engine style applications.
//!
//! Publishers emit messages of three dispatch shapes — untargeted (global),
//! targeted (addressed *to* an entity [`Identity`]), and broadcast
//! (originating *from* an entity identity) — and subscribers register typed
//! handlers that run synchronously on the emitting thread.
//!
//! ## Core Concepts
//!
//! - **MessageBus**: the registry of typed handler tables and the emission
//!   pipeline. Multiple buses are fully isolated; a thread-local default bus
//!   is available through [`default_bus`].
//! - **RegistrationToken**: a subscriber's aggregate of registrations with a
//!   single enable/disable switch, minted per (owner, bus).
//! - **Interceptors** run before normal handlers and can veto delivery;
//!   **post-processors** run after every normal handler of an emission.
//! - **Priorities**: lower values run earlier; registration order breaks
//!   ties.
//! - **Snapshot-on-first-touch**: an emission binds a frozen view of each
//!   handler list it iterates, so handlers can register, remove, and emit
//!   re-entrantly without affecting the in-flight emission.
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::{
//!   cell::Cell,
//!   rc::Rc,
//! };
//!
//! use the_bus::{
//!   Identity,
//!   MessageBus,
//!   TargetedMessage,
//! };
//!
//! struct Damage {
//!   amount: u32,
//! }
//! impl TargetedMessage for Damage {}
//!
//! let bus = MessageBus::new();
//! let player = Identity::from_raw(7);
//! let token = bus.token(player).unwrap();
//!
//! let taken = Rc::new(Cell::new(0));
//! let sink = Rc::clone(&taken);
//! token
//!   .register_targeted::<Damage, _>(player, 0, move |msg| {
//!     sink.set(sink.get() + msg.amount);
//!   })
//!   .unwrap();
//!
//! bus.emit_targeted(player, &Damage { amount: 12 });
//! bus.emit_targeted(Identity::from_raw(8), &Damage { amount: 99 });
//! assert_eq!(taken.get(), 12);
//! ```
//!
//! ## Interceptors
//!
//! An interceptor returning `false` cancels the emission: later
//! interceptors, normal handlers, and post-processors are all skipped.
//!
//! ```rust
//! use std::{
//!   cell::Cell,
//!   rc::Rc,
//! };
//!
//! use the_bus::{
//!   Identity,
//!   MessageBus,
//!   UntargetedMessage,
//! };
//!
//! struct Chat {
//!   muted: bool,
//! }
//! impl UntargetedMessage for Chat {}
//!
//! let bus = MessageBus::new();
//! let token = bus.token(Identity::from_raw(1)).unwrap();
//!
//! let delivered = Rc::new(Cell::new(0u32));
//! let sink = Rc::clone(&delivered);
//! token
//!   .register_untargeted::<Chat, _>(0, move |_msg| {
//!     sink.set(sink.get() + 1);
//!   })
//!   .unwrap();
//! token
//!   .register_untargeted_interceptor::<Chat, _>(0, |msg| !msg.muted)
//!   .unwrap();
//!
//! bus.emit_untargeted(&Chat { muted: false });
//! bus.emit_untargeted(&Chat { muted: true });
//! assert_eq!(delivered.get(), 1);
//! ```
//!
//! ## Lifetimes and mutation during emission
//!
//! Registrations made during an emission become observable with the next
//! emission; removals and token disables take effect immediately, even for
//! entries an in-flight emission has already snapshotted. A destroyed
//! entity is reported with [`MessageBus::deactivate`], which suppresses
//! every entry keyed on it and disables the token it owns.
//!
//! ## Threading
//!
//! Everything is single-threaded by design: a bus and its tokens must stay
//! on the thread that created them, and no locks are taken anywhere on the
//! dispatch path. The only cross-thread state is the message type index
//! registry, which assigns each concrete message type a dense, stable
//! [`MessageTypeIndex`].

mod adapter;
mod bus;
mod diagnostics;
mod error;
mod globals;
mod handle;
mod identity;
mod list;
mod message;
mod ring;
mod shape;
mod table;
mod token;
mod type_index;

pub use adapter::{
  AlwaysAlive,
  HostAdapter,
};
pub use bus::{
  Disposer,
  MessageBus,
};
pub use diagnostics::{
  DiagnosticsMode,
  EmissionOutcome,
  EmissionRecord,
};
pub use error::{
  BusError,
  Result,
};
pub use globals::{
  DEFAULT_DIAGNOSTICS_BUFFER_SIZE,
  default_bus,
  diagnostics_buffer_size,
  diagnostics_mode,
  emit_broadcast,
  emit_targeted,
  emit_untargeted,
  replace_default_bus,
  reset,
  restore_default_bus,
  set_diagnostics_buffer_size,
  set_diagnostics_mode,
};
pub use handle::RegistrationHandle;
pub use identity::Identity;
pub use message::{
  BroadcastMessage,
  Message,
  TargetedMessage,
  UntargetedMessage,
};
pub use ring::CyclicBuffer;
pub use shape::{
  DispatchShape,
  HandlerKind,
};
pub use token::RegistrationToken;
pub use type_index::{
  MessageTypeIndex,
  observed_type_count,
  type_index,
  type_index_of,
};
