//! Pre-configured test data for call-actor testing.
//!
//! Provides:
//! - [`TestCall`] - a spawned call wired to all three mocks
//! - Participant delta builders
//! - Video parameter helpers

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use call_orchestrator::call::{CallDescriptor, GroupCall, GroupCallHandle, State};
use call_orchestrator::config::{CallConfig, CallPermissions};
use call_orchestrator::payload::{SsrcGroup, VideoParams};
use call_orchestrator::signaling::{CallRef, ParticipantUpdate, PeerId};

use crate::mock_engine::{MockEngine, MockEngineFactory};
use crate::mock_signaling::MockSignaling;
use crate::recording_delegate::RecordingDelegate;

/// Call id every fixture call uses.
pub const TEST_CALL_ID: u64 = 1;

/// The fixture call reference.
pub const TEST_CALL: CallRef = CallRef {
    id: TEST_CALL_ID,
    access_hash: 0xDEAD_BEEF,
};

/// The local identity every fixture call joins as.
pub const SELF_PEER: PeerId = PeerId(1);

/// A spawned call actor wired to mock signaling, mock engines and a
/// recording delegate.
pub struct TestCall {
    pub handle: GroupCallHandle,
    pub task: JoinHandle<()>,
    pub signaling: Arc<MockSignaling>,
    pub engines: Arc<MockEngineFactory>,
    pub delegate: Arc<RecordingDelegate>,
}

impl TestCall {
    #[must_use]
    pub fn builder() -> TestCallBuilder {
        TestCallBuilder::default()
    }

    /// Spawn with defaults and let the join round-trip settle.
    pub async fn spawn() -> Self {
        Self::builder().spawn().await
    }

    /// Spawn, join and report the engine connected, landing in `Joined`.
    pub async fn spawn_joined() -> Self {
        let call = Self::spawn().await;
        assert_eq!(call.handle.state(), State::Connecting);
        call.engine().report_connected(true);
        settle().await;
        assert_eq!(call.handle.state(), State::Joined);
        call
    }

    /// The live mock engine. Panics if none was created yet.
    #[must_use]
    pub fn engine(&self) -> Arc<MockEngine> {
        self.engines.engine().expect("no engine created yet")
    }

    /// Feed a roster delta batch for the fixture call.
    pub async fn push_updates(&self, updates: Vec<ParticipantUpdate>) {
        self.handle
            .handle_participant_updates(TEST_CALL_ID, updates)
            .await
            .expect("call actor gone");
        settle().await;
    }
}

/// Builder for [`TestCall`].
pub struct TestCallBuilder {
    descriptor_call: Option<CallRef>,
    join_muted: bool,
    scheduled: bool,
    can_manage: bool,
    push_to_talk_delay: Duration,
    signaling: Arc<MockSignaling>,
}

impl Default for TestCallBuilder {
    fn default() -> Self {
        Self {
            descriptor_call: Some(TEST_CALL),
            join_muted: false,
            scheduled: false,
            can_manage: false,
            push_to_talk_delay: Duration::ZERO,
            signaling: Arc::new(MockSignaling::new()),
        }
    }
}

impl TestCallBuilder {
    /// Start without an existing call, creating one instead.
    #[must_use]
    pub fn creating(mut self) -> Self {
        self.descriptor_call = None;
        self
    }

    #[must_use]
    pub fn join_muted(mut self) -> Self {
        self.join_muted = true;
        self
    }

    /// The call is scheduled for the future.
    #[must_use]
    pub fn scheduled(mut self) -> Self {
        self.scheduled = true;
        self
    }

    #[must_use]
    pub fn can_manage(mut self) -> Self {
        self.can_manage = true;
        self
    }

    #[must_use]
    pub fn push_to_talk_delay(mut self, delay: Duration) -> Self {
        self.push_to_talk_delay = delay;
        self
    }

    /// Use a pre-scripted signaling mock.
    #[must_use]
    pub fn signaling(mut self, signaling: Arc<MockSignaling>) -> Self {
        self.signaling = signaling;
        self
    }

    /// Spawn the actor and let the startup round-trips settle.
    pub async fn spawn(self) -> TestCall {
        let engines = Arc::new(MockEngineFactory::new());
        let delegate = Arc::new(RecordingDelegate::new());

        let descriptor = CallDescriptor {
            config: CallConfig {
                push_to_talk_delay: self.push_to_talk_delay,
                ..CallConfig::default()
            },
            permissions: CallPermissions {
                can_manage: self.can_manage,
                ..CallPermissions::default()
            },
            join_as: SELF_PEER,
            call: self.descriptor_call,
            invite_hash: None,
            scheduled_start: self
                .scheduled
                .then(|| chrono::Utc::now() + chrono::Duration::hours(1)),
            join_muted: self.join_muted,
            signaling: self.signaling.clone(),
            engine_factory: engines.clone(),
            delegate: delegate.clone(),
        };

        let (handle, task) = GroupCall::spawn(descriptor);
        settle().await;

        TestCall {
            handle,
            task,
            signaling: self.signaling,
            engines,
            delegate,
        }
    }
}

/// Let spawned round-trips and mailbox messages run; with a paused clock
/// the sleep auto-advances.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// A participant delta for `peer` with `ssrc` and benign defaults.
#[must_use]
pub fn participant(peer: i64, ssrc: u32) -> ParticipantUpdate {
    ParticipantUpdate {
        peer: PeerId(peer),
        ssrc,
        can_self_unmute: true,
        joined_date: 1_700_000_000,
        ..Default::default()
    }
}

/// A delta removing `peer`.
#[must_use]
pub fn left(peer: i64, ssrc: u32) -> ParticipantUpdate {
    ParticipantUpdate {
        left: true,
        ..participant(peer, ssrc)
    }
}

/// A delta for the local identity.
#[must_use]
pub fn self_update(ssrc: u32) -> ParticipantUpdate {
    ParticipantUpdate {
        is_self: true,
        ..participant(SELF_PEER.0, ssrc)
    }
}

/// A participant whose video runs over `video_ssrcs`.
#[must_use]
pub fn video_participant(peer: i64, ssrc: u32, video_ssrcs: Vec<u32>) -> ParticipantUpdate {
    ParticipantUpdate {
        video_params: Some(VideoParams {
            endpoint: format!("endpoint-{peer}"),
            ssrc_groups: vec![SsrcGroup {
                semantics: "SIM".to_string(),
                sources: video_ssrcs,
            }],
        }),
        ..participant(peer, ssrc)
    }
}
