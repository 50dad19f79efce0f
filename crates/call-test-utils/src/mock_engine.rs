//! Mock media engine for call-actor testing.
//!
//! The engine records every command and hands each test the event sender
//! from its descriptor, so engine events (connectivity, audio levels,
//! video sources, part requests) can be injected at will.
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::MockEngineFactory;
//!
//! let factory = Arc::new(MockEngineFactory::new());
//! // ... spawn the call ...
//! let engine = factory.engine().unwrap();
//! engine.report_connected(true);
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use call_orchestrator::media::{
    ConnectionMode, EngineDescriptor, EngineEvent, LevelUpdate, MediaEngine, MediaEngineFactory,
    NetworkState,
};
use call_orchestrator::payload::{JoinPayload, TransportDescription};

/// Ssrc the first unscripted join payload of an engine carries; later
/// payloads count up from here.
pub const FIRST_ENGINE_SSRC: u32 = 1_000;

/// One recorded engine command.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    SetConnectionMode(ConnectionMode),
    SetMuted(bool),
    SetVolume { ssrc: u32, volume: f64 },
    RemoveSources(Vec<u32>),
    SetJoinResponse(TransportDescription),
    SetFullSizeVideoSource(u32),
    SetOutgoingVideoActive(bool),
    SetAudioInputDevice(String),
    SetAudioOutputDevice(String),
    SetVideoCaptureDevice(String),
}

/// Recording [`MediaEngine`] implementation.
pub struct MockEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    commands: Mutex<Vec<EngineCommand>>,
    scripted_payloads: Mutex<Vec<JoinPayload>>,
    next_ssrc: AtomicU32,
}

impl MockEngine {
    fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            events,
            commands: Mutex::new(Vec::new()),
            scripted_payloads: Mutex::new(Vec::new()),
            next_ssrc: AtomicU32::new(FIRST_ENGINE_SSRC),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, command: EngineCommand) {
        Self::lock(&self.commands).push(command);
    }

    /// Everything the actor asked of the engine, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<EngineCommand> {
        Self::lock(&self.commands).clone()
    }

    /// Volumes set for `ssrc`, in order.
    #[must_use]
    pub fn volumes_for(&self, ssrc: u32) -> Vec<f64> {
        Self::lock(&self.commands)
            .iter()
            .filter_map(|c| match c {
                EngineCommand::SetVolume { ssrc: s, volume } if *s == ssrc => Some(*volume),
                _ => None,
            })
            .collect()
    }

    /// Full-size video sources set, in order.
    #[must_use]
    pub fn full_size_sources(&self) -> Vec<u32> {
        Self::lock(&self.commands)
            .iter()
            .filter_map(|c| match c {
                EngineCommand::SetFullSizeVideoSource(ssrc) => Some(*ssrc),
                _ => None,
            })
            .collect()
    }

    /// Latest capture mute flag the actor applied.
    #[must_use]
    pub fn last_muted(&self) -> Option<bool> {
        Self::lock(&self.commands)
            .iter()
            .rev()
            .find_map(|c| match c {
                EngineCommand::SetMuted(muted) => Some(*muted),
                _ => None,
            })
    }

    /// Latest connection mode the actor applied.
    #[must_use]
    pub fn last_connection_mode(&self) -> Option<ConnectionMode> {
        Self::lock(&self.commands)
            .iter()
            .rev()
            .find_map(|c| match c {
                EngineCommand::SetConnectionMode(mode) => Some(*mode),
                _ => None,
            })
    }

    /// Script the next emitted join payload.
    pub fn push_payload(&self, payload: JoinPayload) {
        Self::lock(&self.scripted_payloads).push(payload);
    }

    // ---- Event injection ----

    pub fn report_network_state(&self, connected: bool, transitioning_from_relay: bool) {
        let _ = self
            .events
            .send(EngineEvent::NetworkStateChanged(NetworkState {
                connected,
                transitioning_from_relay,
            }));
    }

    pub fn report_connected(&self, connected: bool) {
        self.report_network_state(connected, false);
    }

    pub fn report_audio_levels(&self, updates: Vec<LevelUpdate>) {
        let _ = self.events.send(EngineEvent::AudioLevels(updates));
    }

    pub fn report_video_sources(&self, ssrcs: Vec<u32>) {
        let _ = self.events.send(EngineEvent::IncomingVideoSources(ssrcs));
    }

    pub fn send_event(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn emit_join_payload(&self) -> JoinPayload {
        if let Some(payload) = Self::lock(&self.scripted_payloads).pop() {
            return payload;
        }
        JoinPayload {
            ufrag: "mock-uf".to_string(),
            pwd: "mock-pw".to_string(),
            ssrc: self.next_ssrc.fetch_add(1, Ordering::Relaxed),
            ..Default::default()
        }
    }

    fn set_connection_mode(&self, mode: ConnectionMode) {
        self.record(EngineCommand::SetConnectionMode(mode));
    }

    fn set_muted(&self, muted: bool) {
        self.record(EngineCommand::SetMuted(muted));
    }

    fn set_volume(&self, ssrc: u32, volume: f64) {
        self.record(EngineCommand::SetVolume { ssrc, volume });
    }

    fn remove_sources(&self, ssrcs: Vec<u32>) {
        self.record(EngineCommand::RemoveSources(ssrcs));
    }

    fn set_join_response(&self, transport: TransportDescription) {
        self.record(EngineCommand::SetJoinResponse(transport));
    }

    fn set_full_size_video_source(&self, ssrc: u32) {
        self.record(EngineCommand::SetFullSizeVideoSource(ssrc));
    }

    fn set_outgoing_video_active(&self, active: bool) {
        self.record(EngineCommand::SetOutgoingVideoActive(active));
    }

    fn set_audio_input_device(&self, id: &str) {
        self.record(EngineCommand::SetAudioInputDevice(id.to_string()));
    }

    fn set_audio_output_device(&self, id: &str) {
        self.record(EngineCommand::SetAudioOutputDevice(id.to_string()));
    }

    fn set_video_capture_device(&self, id: &str) {
        self.record(EngineCommand::SetVideoCaptureDevice(id.to_string()));
    }
}

/// Factory handing out [`MockEngine`]s and keeping them reachable for
/// assertions and event injection.
#[derive(Default)]
pub struct MockEngineFactory {
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created engine.
    #[must_use]
    pub fn engine(&self) -> Option<Arc<MockEngine>> {
        MockEngine::lock(&self.engines).last().cloned()
    }

    /// How many engines the actor created.
    #[must_use]
    pub fn created(&self) -> usize {
        MockEngine::lock(&self.engines).len()
    }
}

impl MediaEngineFactory for MockEngineFactory {
    fn create(&self, descriptor: EngineDescriptor) -> Arc<dyn MediaEngine> {
        let engine = Arc::new(MockEngine::new(descriptor.events));
        MockEngine::lock(&self.engines).push(engine.clone());
        engine
    }
}
