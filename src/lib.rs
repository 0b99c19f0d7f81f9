//! # tickfsm
//!
//! A timed, transition-driven state machine engine for fixed-tick
//! simulations.
//!
//! This crate provides:
//! - States and transitions with delay windows, message triggers, and
//!   host-evaluated conditions
//! - Priority-ordered transition selection with a bounded
//!   instant-transition loop
//! - Snapshot serialization with replace and insert load modes
//! - An authoritative/follower replication contract
//!
//! The engine decides *when* to invoke host callbacks, never what they
//! mean: enter/update/leave actions, transition-taken actions, and
//! condition predicates are opaque names resolved through the [`Host`]
//! trait supplied by the caller.

pub mod engine;
pub mod error;
pub mod host;
pub mod id;
pub mod snapshot;
pub mod state;
pub mod transition;

pub use engine::{ReplicationSink, Role, StateEngine, MAX_TRANSITIONS_PER_TICK};
pub use error::EngineError;
pub use host::{Host, HostError, NullHost, ScriptedHost};
pub use id::Id;
pub use snapshot::{Snapshot, StateSnapshot, TransitionSnapshot};
pub use state::StateNode;
pub use transition::TransitionEdge;
