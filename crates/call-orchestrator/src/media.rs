//! Media engine seam.
//!
//! The engine owns capture, encoding and transport of media; the
//! orchestrator drives it through [`MediaEngine`] and receives its events
//! through the `mpsc` sender handed over in the [`EngineDescriptor`].
//! Engine callbacks may fire on any thread; the event channel marshals
//! them onto the call actor.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broadcast::BroadcastPartRequest;
use crate::payload::{JoinPayload, TransportDescription};

/// How the engine moves media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Not connected; set while a join round-trip is outstanding.
    None,
    /// Full RTC connection described by the join response transport.
    Direct,
    /// Listening to a server-mixed broadcast; media arrives as pulled
    /// stream segments.
    BroadcastRelay,
}

/// Engine connectivity as tracked by the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    /// Connected, but still migrating from the broadcast relay to a
    /// direct connection.
    TransitioningFromRelay,
    Connected,
}

/// Raw connectivity report from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub transitioning_from_relay: bool,
}

/// One audio level sample. `ssrc == 0` means the local capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelUpdate {
    pub ssrc: u32,
    pub level: f32,
    /// Whether voice activity was detected in the sample.
    pub voice: bool,
}

/// Event pushed by the engine toward the call actor.
#[derive(Debug)]
pub enum EngineEvent {
    NetworkStateChanged(NetworkState),
    /// Batch of audio level samples.
    AudioLevels(Vec<LevelUpdate>),
    /// Full set of source ids currently delivering incoming video.
    IncomingVideoSources(Vec<u32>),
    /// The engine pulls a broadcast stream segment.
    BroadcastPartRequested(Arc<BroadcastPartRequest>),
}

/// Everything the engine needs at creation time.
pub struct EngineDescriptor {
    pub audio_input_id: String,
    pub audio_output_id: String,
    pub video_input_id: String,
    /// Whether outgoing video starts enabled.
    pub outgoing_video_active: bool,
    /// Channel the engine pushes its events into.
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

/// Control surface of a live media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Produce a fresh join payload (new ufrag/pwd/ssrc).
    async fn emit_join_payload(&self) -> JoinPayload;

    fn set_connection_mode(&self, mode: ConnectionMode);

    /// Mute or unmute the local capture.
    fn set_muted(&self, muted: bool);

    /// Playback volume for one source, 1.0 being nominal.
    fn set_volume(&self, ssrc: u32, volume: f64);

    /// Drop decoding state for sources that left the call.
    fn remove_sources(&self, ssrcs: Vec<u32>);

    /// Apply the server transport description from a join response.
    fn set_join_response(&self, transport: TransportDescription);

    /// Which incoming video source gets full-size treatment; zero for
    /// none.
    fn set_full_size_video_source(&self, ssrc: u32);

    fn set_outgoing_video_active(&self, active: bool);

    fn set_audio_input_device(&self, id: &str);
    fn set_audio_output_device(&self, id: &str);
    fn set_video_capture_device(&self, id: &str);
}

/// Creates engines; injected so tests can substitute a mock.
pub trait MediaEngineFactory: Send + Sync {
    fn create(&self, descriptor: EngineDescriptor) -> Arc<dyn MediaEngine>;
}

impl NetworkState {
    /// Collapse the raw report into the actor's connectivity state.
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        if !self.connected {
            Connectivity::Disconnected
        } else if self.transitioning_from_relay {
            Connectivity::TransitioningFromRelay
        } else {
            Connectivity::Connected
        }
    }
}
