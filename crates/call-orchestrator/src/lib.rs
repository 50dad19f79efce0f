//! Group Call Orchestrator Library
//!
//! This library provides the client-side session core for group voice and
//! video calls - a per-call actor responsible for:
//!
//! - Session lifecycle and join/rejoin protocol with generation fencing
//! - Roster synchronization from server participant deltas
//! - Speaking activity tracking from engine audio levels
//! - Video stream selection (pinning and activity-based promotion)
//! - Broadcast part loading for relay-consumed live streams
//! - Mute and volume propagation between server, engine and embedder
//!
//! # Architecture
//!
//! Each call is one actor owning all mutable state:
//!
//! ```text
//! GroupCall (one per active call)
//! ├── owns state machine, roster, activity and stream selection
//! ├── drives SignalingApi (network requests, spawned, marshalled back)
//! └── drives MediaEngine (commands out, events in over a channel)
//! ```
//!
//! The signaling service and the media engine are injected behind traits
//! and never talk to each other directly; every completion and engine
//! event is marshalled back into the actor's mailbox.
//!
//! # Key Design Decisions
//!
//! - **Generation fencing**: each join attempt carries a generation; a
//!   completion from a superseded attempt is dropped on arrival
//! - **Single-owner state**: no locks; the mailbox serializes everything
//! - **Watch channels for hot state**: session state, mute state and the
//!   full-size video source are observable without a round-trip
//!
//! # Modules
//!
//! - [`call`] - The call actor, its handle and the state machine
//! - [`signaling`] - Signaling service trait and wire types
//! - [`media`] - Media engine traits, events and connectivity
//! - [`roster`] - Participant list and delta application
//! - [`activity`] - Speaking activity tracking
//! - [`streams`] - Video stream selection
//! - [`broadcast`] - Broadcast part requests and classification
//! - [`payload`] - Join payload / response wire shapes
//! - [`config`] - Call configuration and permissions
//! - [`errors`] - Error types and server error reasons

pub mod activity;
pub mod broadcast;
pub mod call;
pub mod config;
pub mod errors;
pub mod media;
pub mod payload;
pub mod roster;
pub mod signaling;
pub mod streams;

pub use call::{
    CallDelegate, CallDescriptor, CallSound, GroupCall, GroupCallHandle, MuteState,
    OtherParticipantState, State,
};
pub use config::{CallConfig, CallPermissions};
pub use errors::{CallError, JoinFailure, RequestError};
pub use media::{ConnectionMode, EngineEvent, LevelUpdate, MediaEngine, MediaEngineFactory};
pub use roster::Participant;
pub use signaling::{CallRef, ParticipantUpdate, PeerId, SignalingApi};
