//! gatekeeper-relay: the authenticating relay engine.
//!
//! [`Listener`] accepts connections and runs the [`handshake`]; each
//! authenticated connection becomes a [`Session`] relaying bytes to its
//! endpoint. Work runs on the tiers in [`worker`] and is tracked in the
//! [`Registry`].

pub mod handshake;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod session;
pub mod worker;

pub use handshake::{authenticate, HandshakeError, Route};
pub use lifecycle::{escalate, EscalationReport, Lifecycle};
pub use listener::{FilterHook, Listener, ListenerHandle};
pub use registry::{ConnId, Registry};
pub use session::{Session, SessionExit, SessionSockets};
pub use worker::{IsolatedWorker, LightTask, Spawner, Tier, WorkHandle};
