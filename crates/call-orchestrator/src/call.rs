//! `GroupCall` - the per-call actor that owns all session state.
//!
//! Each `GroupCall`:
//! - Owns the session state machine, roster, activity and stream
//!   selection for one call
//! - Drives the signaling service and the media engine, which never talk
//!   to each other directly
//! - Marshals every completion and engine callback back into its own
//!   mailbox, so state is only ever touched from one task
//!
//! Network completions carry the join generation they were issued under;
//! completions from a superseded join are dropped on arrival.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::activity::{ActivityTracker, CHECK_LAST_SPOKE_INTERVAL_MS};
use crate::broadcast::{
    classify_fetch_error, response_timestamp_ms, BroadcastPart, BroadcastPartRequest,
    PartFetchError, PartStatus, STREAM_PART_LIMIT,
};
use crate::config::{CallConfig, CallPermissions};
use crate::errors::{reasons, CallError, JoinFailure, RequestError};
use crate::media::{
    ConnectionMode, Connectivity, EngineDescriptor, EngineEvent, LevelUpdate, MediaEngine,
    MediaEngineFactory, NetworkState,
};
use crate::payload::{JoinPayload, JoinResponse};
use crate::roster::{Participant, ParticipantDiff, Roster, DEFAULT_VOLUME, MAX_VOLUME};
use crate::signaling::{
    CallRef, CallUpdate, JoinAck, JoinRequest, ParticipantEditRequest, ParticipantUpdate,
    PartFetchResponse, PeerId, SelfEditKind, SelfEditRequest, SignalingApi,
};
use crate::streams::{StreamsOutcome, VideoStreams};

/// Mailbox buffer for the call actor.
const CALL_CHANNEL_BUFFER: usize = 500;

/// While `Connecting`, the server is asked every 4 s whether it still
/// considers our ssrc part of the call.
const CHECK_JOINED_TIMEOUT: Duration = Duration::from_secs(4);

/// Connecting tone replay period after the first successful join.
const CONNECTING_SOUND_EACH: Duration = Duration::from_millis(3_056);

/// Invites go out in slices of this many users.
const INVITE_SLICE: usize = 10;

/// Session state. `Failed` absorbs every transition; `FailedHangingUp`
/// only exits to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Scheduled call, not live yet.
    Waiting,
    /// Join round-trip outstanding.
    Joining,
    /// Joined server-side, media not connected.
    Connecting,
    Joined,
    /// Leave round-trip outstanding, ending normally.
    HangingUp,
    /// Leave round-trip outstanding, ending in failure.
    FailedHangingUp,
    Ended,
    Failed,
}

/// Local microphone state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteState {
    Active,
    Muted,
    /// Temporarily unmuted while the push-to-talk key is held.
    PushToTalk,
    /// Muted by an admin, not allowed to unmute.
    ForceMuted,
    /// Force-muted with the hand raised.
    RaisedHand,
}

/// Sounds the embedder plays on behalf of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSound {
    Connecting,
    Started,
    Ended,
    AllowedToSpeak,
}

/// Volume / local-mute change of another participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtherParticipantState {
    pub peer: PeerId,
    pub volume: i32,
    pub muted_by_me: bool,
}

/// Everything the call reports back to the embedder.
pub trait CallDelegate: Send + Sync {
    fn play_sound(&self, sound: CallSound);
    /// The call ended normally.
    fn call_finished(&self);
    /// The call ended in failure.
    fn call_failed(&self);
    /// A join attempt failed with a categorized reason.
    fn join_failed(&self, failure: JoinFailure);
    /// An admin allowed us to speak.
    fn allowed_to_speak(&self);
    /// A source started or stopped delivering visible video.
    fn streams_video_updated(&self, ssrc: u32, streaming: bool);
    /// Another participant's volume or local mute changed.
    fn other_participant_state(&self, state: OtherParticipantState);
    /// One audio level sample, self resolved to our ssrc.
    fn level_updated(&self, update: LevelUpdate);
}

/// Everything needed to spawn a call.
pub struct CallDescriptor {
    pub config: CallConfig,
    pub permissions: CallPermissions,
    /// Identity to join as.
    pub join_as: PeerId,
    /// Existing call to join; `None` creates a new one.
    pub call: Option<CallRef>,
    /// Invite-link hash, when joining through one.
    pub invite_hash: Option<String>,
    /// Start time of a scheduled call; the call waits until the server
    /// clears it.
    pub scheduled_start: Option<DateTime<Utc>>,
    /// Whether to join with the microphone muted.
    pub join_muted: bool,
    pub signaling: Arc<dyn SignalingApi>,
    pub engine_factory: Arc<dyn MediaEngineFactory>,
    pub delegate: Arc<dyn CallDelegate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishKind {
    Ended,
    Failed,
}

#[derive(Debug)]
enum PartFetchOutcome {
    Response(PartFetchResponse),
    Failed(RequestError),
    Cancelled,
}

enum CallMessage {
    // Inbound server events, forwarded by the embedder.
    CallUpdated(CallUpdate),
    ParticipantUpdates {
        call_id: u64,
        updates: Vec<ParticipantUpdate>,
    },

    // Commands.
    Hangup,
    Discard,
    StartScheduledNow,
    ToggleStartSubscription {
        subscribed: bool,
    },
    SetMuted {
        mute: MuteState,
    },
    SetMutedAndUpdate {
        mute: MuteState,
    },
    PushToTalk {
        pressed: bool,
    },
    ToggleVideo {
        active: bool,
    },
    PinVideoStream {
        ssrc: u32,
    },
    ToggleMuteParticipant {
        peer: PeerId,
        mute: bool,
        locally_only: bool,
    },
    ChangeVolume {
        peer: PeerId,
        volume: i32,
        locally_only: bool,
    },
    Invite {
        users: Vec<PeerId>,
    },
    EditTitle {
        title: String,
    },
    ToggleRecording {
        start: bool,
        title: Option<String>,
    },
    RejoinWithHash {
        hash: String,
    },
    RejoinAs {
        join_as: PeerId,
    },
    SetAudioInput {
        id: String,
    },
    SetAudioOutput {
        id: String,
    },
    SetVideoCaptureDevice {
        id: String,
    },

    // Queries.
    GetParticipants {
        respond_to: oneshot::Sender<Vec<Participant>>,
    },
    GetMySsrc {
        respond_to: oneshot::Sender<u32>,
    },
    GetConnectionMode {
        respond_to: oneshot::Sender<ConnectionMode>,
    },

    // Marshalled completions of spawned requests.
    CreateFinished {
        result: Result<CallRef, RequestError>,
    },
    JoinPayloadReady {
        generation: u64,
        payload: JoinPayload,
    },
    JoinFinished {
        generation: u64,
        ssrc: u32,
        was_mute_state: MuteState,
        result: Result<JoinAck, RequestError>,
    },
    LeaveFinished {
        kind: FinishKind,
    },
    SelfEditFinished {
        seq: u64,
        result: Result<(), RequestError>,
    },
    ParticipantEditFinished {
        result: Result<(), RequestError>,
    },
    CheckCallFinished {
        result: Result<Vec<u32>, RequestError>,
    },
    RecordingToggleFinished {
        result: Result<(), RequestError>,
    },
    DiscardFinished {
        result: Result<(), RequestError>,
    },
    PartFetchFinished {
        time_ms: i64,
        scale_index: i32,
        outcome: PartFetchOutcome,
    },
}

/// Handle to a running [`GroupCall`].
#[derive(Clone)]
pub struct GroupCallHandle {
    sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,
    state_rx: watch::Receiver<State>,
    mute_rx: watch::Receiver<MuteState>,
    large_rx: watch::Receiver<u32>,
}

impl GroupCallHandle {
    /// Current session state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state_rx.borrow()
    }

    /// Current local mute state.
    #[must_use]
    pub fn muted(&self) -> MuteState {
        *self.mute_rx.borrow()
    }

    /// Current full-size video source, zero for none.
    #[must_use]
    pub fn large_video(&self) -> u32 {
        *self.large_rx.borrow()
    }

    /// Watch the session state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_rx.clone()
    }

    /// Watch the local mute state.
    #[must_use]
    pub fn subscribe_muted(&self) -> watch::Receiver<MuteState> {
        self.mute_rx.clone()
    }

    /// Watch the full-size video source.
    #[must_use]
    pub fn subscribe_large_video(&self) -> watch::Receiver<u32> {
        self.large_rx.clone()
    }

    /// Forward a call-level server event.
    pub async fn handle_call_update(&self, update: CallUpdate) -> Result<(), CallError> {
        self.send(CallMessage::CallUpdated(update)).await
    }

    /// Forward a roster delta batch for `call_id`.
    pub async fn handle_participant_updates(
        &self,
        call_id: u64,
        updates: Vec<ParticipantUpdate>,
    ) -> Result<(), CallError> {
        self.send(CallMessage::ParticipantUpdates { call_id, updates })
            .await
    }

    /// Leave the call.
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.send(CallMessage::Hangup).await
    }

    /// Discard the call for everyone (leader only).
    pub async fn discard(&self) -> Result<(), CallError> {
        self.send(CallMessage::Discard).await
    }

    /// Launch a scheduled call immediately.
    pub async fn start_scheduled_now(&self) -> Result<(), CallError> {
        self.send(CallMessage::StartScheduledNow).await
    }

    /// Subscribe to / unsubscribe from the scheduled start notification.
    pub async fn toggle_start_subscription(&self, subscribed: bool) -> Result<(), CallError> {
        self.send(CallMessage::ToggleStartSubscription { subscribed })
            .await
    }

    /// Change the local mute state.
    pub async fn set_muted(&self, mute: MuteState) -> Result<(), CallError> {
        self.send(CallMessage::SetMuted { mute }).await
    }

    /// Change the local mute state and force the server update even for
    /// transitions that would otherwise stay local.
    pub async fn set_muted_and_update(&self, mute: MuteState) -> Result<(), CallError> {
        self.send(CallMessage::SetMutedAndUpdate { mute }).await
    }

    /// Push-to-talk key pressed or released.
    pub async fn push_to_talk(&self, pressed: bool) -> Result<(), CallError> {
        self.send(CallMessage::PushToTalk { pressed }).await
    }

    /// Enable or disable outgoing video.
    pub async fn toggle_video(&self, active: bool) -> Result<(), CallError> {
        self.send(CallMessage::ToggleVideo { active }).await
    }

    /// Pin a video source (zero unpins).
    pub async fn pin_video_stream(&self, ssrc: u32) -> Result<(), CallError> {
        self.send(CallMessage::PinVideoStream { ssrc }).await
    }

    /// Mute or unmute another participant.
    pub async fn toggle_mute_participant(
        &self,
        peer: PeerId,
        mute: bool,
        locally_only: bool,
    ) -> Result<(), CallError> {
        self.send(CallMessage::ToggleMuteParticipant {
            peer,
            mute,
            locally_only,
        })
        .await
    }

    /// Change another participant's playback volume.
    pub async fn change_volume(
        &self,
        peer: PeerId,
        volume: i32,
        locally_only: bool,
    ) -> Result<(), CallError> {
        self.send(CallMessage::ChangeVolume {
            peer,
            volume,
            locally_only,
        })
        .await
    }

    /// Invite users into the call.
    pub async fn invite(&self, users: Vec<PeerId>) -> Result<(), CallError> {
        self.send(CallMessage::Invite { users }).await
    }

    /// Change the call title; best effort.
    pub async fn edit_title(&self, title: String) -> Result<(), CallError> {
        self.send(CallMessage::EditTitle { title }).await
    }

    /// Start or stop server-side recording.
    pub async fn toggle_recording(
        &self,
        start: bool,
        title: Option<String>,
    ) -> Result<(), CallError> {
        self.send(CallMessage::ToggleRecording { start, title }).await
    }

    /// Rejoin through an invite link while force-muted.
    pub async fn rejoin_with_hash(&self, hash: String) -> Result<(), CallError> {
        self.send(CallMessage::RejoinWithHash { hash }).await
    }

    /// Rejoin under a different identity.
    pub async fn rejoin_as(&self, join_as: PeerId) -> Result<(), CallError> {
        self.send(CallMessage::RejoinAs { join_as }).await
    }

    pub async fn set_audio_input_device(&self, id: String) -> Result<(), CallError> {
        self.send(CallMessage::SetAudioInput { id }).await
    }

    pub async fn set_audio_output_device(&self, id: String) -> Result<(), CallError> {
        self.send(CallMessage::SetAudioOutput { id }).await
    }

    pub async fn set_video_capture_device(&self, id: String) -> Result<(), CallError> {
        self.send(CallMessage::SetVideoCaptureDevice { id }).await
    }

    /// Snapshot of the roster.
    pub async fn participants(&self) -> Result<Vec<Participant>, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::GetParticipants { respond_to: tx })
            .await?;
        rx.await.map_err(|_| CallError::ActorGone)
    }

    /// Our current audio ssrc, zero while not joined.
    pub async fn my_ssrc(&self) -> Result<u32, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::GetMySsrc { respond_to: tx }).await?;
        rx.await.map_err(|_| CallError::ActorGone)
    }

    /// Current engine connection mode.
    pub async fn connection_mode(&self) -> Result<ConnectionMode, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(CallMessage::GetConnectionMode { respond_to: tx })
            .await?;
        rx.await.map_err(|_| CallError::ActorGone)
    }

    /// Tear the actor down.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: CallMessage) -> Result<(), CallError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| CallError::ActorGone)
    }
}

/// The call actor. Spawn it with [`GroupCall::spawn`]; everything else
/// happens through the handle.
pub struct GroupCall {
    receiver: mpsc::Receiver<CallMessage>,
    self_sender: mpsc::Sender<CallMessage>,
    cancel_token: CancellationToken,

    signaling: Arc<dyn SignalingApi>,
    engine_factory: Arc<dyn MediaEngineFactory>,
    delegate: Arc<dyn CallDelegate>,
    config: CallConfig,
    permissions: CallPermissions,

    call: Option<CallRef>,
    join_as: PeerId,
    invite_hash: Option<String>,
    scheduled_start: Option<DateTime<Utc>>,

    state_tx: watch::Sender<State>,
    mute_tx: watch::Sender<MuteState>,
    large_tx: watch::Sender<u32>,

    engine: Option<Arc<dyn MediaEngine>>,
    engine_events_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    connectivity: Connectivity,
    transitioning_from_relay: bool,
    connection_mode: ConnectionMode,

    roster: Roster,
    activity: ActivityTracker,
    streams: VideoStreams,

    join_generation: u64,
    my_ssrc: u32,
    /// Every ssrc we ever held in this call, for stale-echo detection.
    my_ssrcs: HashSet<u32>,
    queued_self_updates: VecDeque<ParticipantUpdate>,
    initial_mute_sent: bool,
    had_joined: bool,
    video_active: bool,

    self_edit_seq: u64,
    pending_self_edit: Option<JoinHandle<()>>,

    recording_stopped_by_me: bool,
    record_start_date: Option<i64>,

    outstanding_parts: HashMap<(i64, i32), Arc<BroadcastPartRequest>>,

    /// Monotonic base for activity timestamps.
    started_at: Instant,

    last_spoke_deadline: Option<Instant>,
    check_joined_deadline: Option<Instant>,
    ptt_deadline: Option<Instant>,
    connecting_sound_deadline: Option<Instant>,
}

/// Sleep until an optional deadline; no deadline never wakes.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Whether the engine capture should be muted in this state.
fn engine_muted(mute: MuteState) -> bool {
    !matches!(mute, MuteState::Active | MuteState::PushToTalk)
}

/// Whether the server-side muted flag is set in this state.
fn wire_muted(mute: MuteState) -> bool {
    mute != MuteState::Active
}

/// Which self update (if any) a mute transition sends to the server.
/// Only Active <-> Muted/PushToTalk and ForceMuted <-> RaisedHand
/// generate traffic.
fn muted_update_kind(previous: MuteState, now: MuteState) -> Option<SelfEditKind> {
    if (previous == MuteState::Active && now == MuteState::Muted)
        || (now == MuteState::Active
            && (previous == MuteState::Muted || previous == MuteState::PushToTalk))
    {
        Some(SelfEditKind::Mute)
    } else if (now == MuteState::ForceMuted && previous == MuteState::RaisedHand)
        || (now == MuteState::RaisedHand && previous == MuteState::ForceMuted)
    {
        Some(SelfEditKind::RaiseHand)
    } else {
        None
    }
}

impl GroupCall {
    /// Spawn the call actor.
    ///
    /// Returns a handle and the task join handle. Joining (or creating)
    /// starts immediately.
    pub fn spawn(descriptor: CallDescriptor) -> (GroupCallHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CALL_CHANNEL_BUFFER);
        let (engine_events_tx, engine_events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(State::Joining);
        let initial_mute = if descriptor.join_muted {
            MuteState::Muted
        } else {
            MuteState::Active
        };
        let (mute_tx, mute_rx) = watch::channel(initial_mute);
        let (large_tx, large_rx) = watch::channel(0u32);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            signaling: descriptor.signaling,
            engine_factory: descriptor.engine_factory,
            delegate: descriptor.delegate,
            config: descriptor.config,
            permissions: descriptor.permissions,
            call: descriptor.call,
            join_as: descriptor.join_as,
            invite_hash: descriptor.invite_hash,
            scheduled_start: descriptor.scheduled_start,
            state_tx,
            mute_tx,
            large_tx,
            engine: None,
            engine_events_tx,
            engine_events,
            connectivity: Connectivity::Disconnected,
            transitioning_from_relay: false,
            connection_mode: ConnectionMode::None,
            roster: Roster::default(),
            activity: ActivityTracker::default(),
            streams: VideoStreams::default(),
            join_generation: 0,
            my_ssrc: 0,
            my_ssrcs: HashSet::new(),
            queued_self_updates: VecDeque::new(),
            initial_mute_sent: false,
            had_joined: false,
            video_active: false,
            self_edit_seq: 0,
            pending_self_edit: None,
            recording_stopped_by_me: false,
            record_start_date: None,
            outstanding_parts: HashMap::new(),
            started_at: Instant::now(),
            last_spoke_deadline: None,
            check_joined_deadline: None,
            ptt_deadline: None,
            connecting_sound_deadline: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = GroupCallHandle {
            sender,
            cancel_token,
            state_rx,
            mute_rx,
            large_rx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "call.actor", fields(join_as = self.join_as.0))]
    async fn run(mut self) {
        info!(
            target: "call.actor",
            join_as = self.join_as.0,
            existing_call = self.call.is_some(),
            "GroupCall actor started"
        );

        self.startup();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "call.actor", "GroupCall actor cancelled");
                    self.cancel_outstanding_parts();
                    break;
                }

                () = sleep_opt(self.last_spoke_deadline) => {
                    self.check_last_spoke();
                }

                () = sleep_opt(self.check_joined_deadline) => {
                    self.check_joined_deadline = None;
                    self.check_joined();
                }

                () = sleep_opt(self.ptt_deadline) => {
                    self.push_to_talk_timeout();
                }

                () = sleep_opt(self.connecting_sound_deadline) => {
                    self.connecting_sound_deadline =
                        Some(Instant::now() + CONNECTING_SOUND_EACH);
                    self.delegate.play_sound(CallSound::Connecting);
                }

                event = self.engine_events.recv() => {
                    // The actor holds a sender clone, so the channel
                    // stays open for its whole life.
                    if let Some(event) = event {
                        self.handle_engine_event(event);
                    }
                }

                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(target: "call.actor", "GroupCall channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "call.actor",
            state = ?self.state(),
            "GroupCall actor stopped"
        );
    }

    fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    fn muted(&self) -> MuteState {
        *self.mute_tx.borrow()
    }

    fn now_ms(&self) -> i64 {
        i64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn startup(&mut self) {
        match self.call {
            Some(call) => self.join_call(call),
            None => self.create_call(),
        }
    }

    fn handle_message(&mut self, message: CallMessage) {
        match message {
            CallMessage::CallUpdated(update) => self.handle_call_update(update),
            CallMessage::ParticipantUpdates { call_id, updates } => {
                self.handle_participant_updates(call_id, updates);
            }
            CallMessage::Hangup => self.finish(FinishKind::Ended),
            CallMessage::Discard => self.discard(),
            CallMessage::StartScheduledNow => self.start_scheduled_now(),
            CallMessage::ToggleStartSubscription { subscribed } => {
                self.toggle_start_subscription(subscribed);
            }
            CallMessage::SetMuted { mute } => self.set_muted(mute),
            CallMessage::SetMutedAndUpdate { mute } => self.set_muted_and_update(mute),
            CallMessage::PushToTalk { pressed } => self.push_to_talk(pressed),
            CallMessage::ToggleVideo { active } => self.toggle_video(active),
            CallMessage::PinVideoStream { ssrc } => self.pin_video_stream(ssrc),
            CallMessage::ToggleMuteParticipant {
                peer,
                mute,
                locally_only,
            } => {
                self.apply_participant_locally(peer, mute, None);
                if !locally_only {
                    self.edit_participant(peer, mute, None);
                }
            }
            CallMessage::ChangeVolume {
                peer,
                volume,
                locally_only,
            } => {
                let volume = volume.clamp(1, MAX_VOLUME);
                self.apply_participant_locally(peer, false, Some(volume));
                if !locally_only {
                    self.edit_participant(peer, false, Some(volume));
                }
            }
            CallMessage::Invite { users } => self.invite(users),
            CallMessage::EditTitle { title } => self.edit_title(title),
            CallMessage::ToggleRecording { start, title } => self.toggle_recording(start, title),
            CallMessage::RejoinWithHash { hash } => self.rejoin_with_hash(hash),
            CallMessage::RejoinAs { join_as } => self.rejoin_as(join_as),
            CallMessage::SetAudioInput { id } => {
                self.config.audio_input_id = id.clone();
                if let Some(engine) = &self.engine {
                    engine.set_audio_input_device(&id);
                }
            }
            CallMessage::SetAudioOutput { id } => {
                self.config.audio_output_id = id.clone();
                if let Some(engine) = &self.engine {
                    engine.set_audio_output_device(&id);
                }
            }
            CallMessage::SetVideoCaptureDevice { id } => {
                self.config.video_input_id = id.clone();
                if let Some(engine) = &self.engine {
                    engine.set_video_capture_device(&id);
                }
            }
            CallMessage::GetParticipants { respond_to } => {
                let _ = respond_to.send(self.roster.participants().to_vec());
            }
            CallMessage::GetMySsrc { respond_to } => {
                let _ = respond_to.send(self.my_ssrc);
            }
            CallMessage::GetConnectionMode { respond_to } => {
                let _ = respond_to.send(self.connection_mode);
            }
            CallMessage::CreateFinished { result } => self.create_finished(result),
            CallMessage::JoinPayloadReady {
                generation,
                payload,
            } => self.join_payload_ready(generation, payload),
            CallMessage::JoinFinished {
                generation,
                ssrc,
                was_mute_state,
                result,
            } => self.join_finished(generation, ssrc, was_mute_state, result),
            CallMessage::LeaveFinished { kind } => {
                let final_state = match kind {
                    FinishKind::Ended => State::Ended,
                    FinishKind::Failed => State::Failed,
                };
                self.set_state(final_state);
            }
            CallMessage::SelfEditFinished { seq, result } => self.self_edit_finished(seq, result),
            CallMessage::ParticipantEditFinished { result } => {
                if let Err(error) = result {
                    if error.reason == reasons::FORBIDDEN {
                        warn!(target: "call.actor", "Participant edit forbidden, rejoining");
                        self.rejoin();
                    } else {
                        warn!(
                            target: "call.actor",
                            reason = %error.reason,
                            "Participant edit failed"
                        );
                    }
                }
            }
            CallMessage::CheckCallFinished { result } => self.check_call_finished(result),
            CallMessage::RecordingToggleFinished { result } => {
                self.recording_stopped_by_me = false;
                if let Err(error) = result {
                    warn!(
                        target: "call.actor",
                        reason = %error.reason,
                        "Recording toggle failed"
                    );
                }
            }
            CallMessage::DiscardFinished { result } => {
                if let Err(error) = result {
                    warn!(
                        target: "call.actor",
                        reason = %error.reason,
                        "Discard failed, hanging up"
                    );
                    self.finish(FinishKind::Ended);
                }
            }
            CallMessage::PartFetchFinished {
                time_ms,
                scale_index,
                outcome,
            } => self.part_fetch_finished(time_ms, scale_index, outcome),
        }
    }

    // ---- State machine ----

    fn set_state(&mut self, state: State) {
        let current = self.state();
        if current == state || current == State::Failed {
            return;
        }
        if current == State::FailedHangingUp && state != State::Failed {
            return;
        }
        info!(
            target: "call.actor",
            from = ?current,
            to = ?state,
            "State changed"
        );
        self.state_tx.send_replace(state);

        if state == State::Joined {
            self.connecting_sound_deadline = None;
        }
        if matches!(state, State::Ended | State::Failed) {
            // Engine torn down before the embedder hears about the end.
            self.teardown();
        }
        match state {
            State::HangingUp | State::FailedHangingUp => {
                self.delegate.play_sound(CallSound::Ended);
            }
            State::Ended => self.delegate.call_finished(),
            State::Failed => self.delegate.call_failed(),
            State::Connecting => {
                if self.check_joined_deadline.is_none() {
                    self.check_joined_deadline = Some(Instant::now() + CHECK_JOINED_TIMEOUT);
                }
            }
            _ => {}
        }
    }

    fn teardown(&mut self) {
        self.cancel_outstanding_parts();
        if let Some(task) = self.pending_self_edit.take() {
            task.abort();
        }
        self.engine = None;
        self.connection_mode = ConnectionMode::None;
        self.last_spoke_deadline = None;
        self.check_joined_deadline = None;
        self.ptt_deadline = None;
        self.connecting_sound_deadline = None;
    }

    fn finish(&mut self, kind: FinishKind) {
        let state = self.state();
        if matches!(
            state,
            State::HangingUp | State::FailedHangingUp | State::Ended | State::Failed
        ) {
            return;
        }
        let (hangup_state, final_state) = match kind {
            FinishKind::Ended => (State::HangingUp, State::Ended),
            FinishKind::Failed => (State::FailedHangingUp, State::Failed),
        };
        let (Some(call), ssrc) = (self.call, self.my_ssrc) else {
            self.set_state(final_state);
            return;
        };
        if ssrc == 0 {
            // Never confirmed server-side: no leave round-trip needed.
            self.set_state(final_state);
            return;
        }
        self.set_state(hangup_state);
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.leave_call(call, ssrc).await {
                warn!(target: "call.actor", reason = %error.reason, "Leave failed");
            }
            let _ = sender.send(CallMessage::LeaveFinished { kind }).await;
        });
    }

    // ---- Create / join / rejoin ----

    fn create_call(&mut self) {
        let random_id: i32 = rand::thread_rng().gen();
        let schedule = self.scheduled_start;
        info!(
            target: "call.actor",
            scheduled = schedule.is_some(),
            "Creating group call"
        );
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.create_call(random_id, schedule).await;
            let _ = sender.send(CallMessage::CreateFinished { result }).await;
        });
    }

    fn create_finished(&mut self, result: Result<CallRef, RequestError>) {
        match result {
            Ok(call) => {
                info!(target: "call.actor", call_id = call.id, "Group call created");
                self.call = Some(call);
                self.join_call(call);
            }
            Err(error) => {
                error!(
                    target: "call.actor",
                    reason = %error.reason,
                    "Group call creation failed"
                );
                if error.reason == reasons::ANONYMOUS_FORBIDDEN {
                    self.delegate.join_failed(JoinFailure::AnonymousForbidden);
                }
                self.finish(FinishKind::Failed);
            }
        }
    }

    fn join_call(&mut self, call: CallRef) {
        self.call = Some(call);
        if self.scheduled_start.is_some() {
            self.set_state(State::Waiting);
            return;
        }
        self.set_state(State::Joining);
        self.rejoin();
    }

    fn rejoin(&mut self) {
        self.rejoin_with(self.join_as);
    }

    fn rejoin_with(&mut self, join_as: PeerId) {
        if !matches!(
            self.state(),
            State::Joining | State::Joined | State::Connecting
        ) {
            return;
        }
        let Some(call) = self.call else {
            return;
        };
        self.join_as = join_as;
        self.my_ssrc = 0;
        self.initial_mute_sent = false;
        self.set_state(State::Joining);

        let engine = self.ensure_engine();
        engine.set_connection_mode(ConnectionMode::None);
        self.connection_mode = ConnectionMode::None;
        self.apply_self_locally();

        self.join_generation += 1;
        let generation = self.join_generation;
        info!(
            target: "call.actor",
            call_id = call.id,
            generation,
            "Requesting join payload"
        );
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let payload = engine.emit_join_payload().await;
            let _ = sender
                .send(CallMessage::JoinPayloadReady {
                    generation,
                    payload,
                })
                .await;
        });
    }

    fn join_payload_ready(&mut self, generation: u64, payload: JoinPayload) {
        if generation != self.join_generation || self.state() != State::Joining {
            debug!(target: "call.actor", generation, "Dropping stale join payload");
            return;
        }
        let Some(call) = self.call else {
            return;
        };
        let ssrc = payload.ssrc;
        let payload_json = match payload.encode() {
            Ok(json) => json,
            Err(error) => {
                error!(target: "call.actor", %error, "Join payload serialization failed");
                self.finish(FinishKind::Failed);
                return;
            }
        };
        let was_mute_state = self.muted();
        let request = JoinRequest {
            call,
            join_as: self.join_as,
            invite_hash: self.invite_hash.clone(),
            muted: wire_muted(was_mute_state),
            payload_json,
        };
        info!(target: "call.actor", call_id = call.id, ssrc, "Sending join request");
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.join_call(request).await;
            let _ = sender
                .send(CallMessage::JoinFinished {
                    generation,
                    ssrc,
                    was_mute_state,
                    result,
                })
                .await;
        });
    }

    fn join_finished(
        &mut self,
        generation: u64,
        ssrc: u32,
        was_mute_state: MuteState,
        result: Result<JoinAck, RequestError>,
    ) {
        if generation != self.join_generation || self.state() != State::Joining {
            debug!(target: "call.actor", generation, "Dropping stale join completion");
            return;
        }
        match result {
            Ok(ack) => {
                self.my_ssrc = ssrc;
                self.my_ssrcs.insert(ssrc);
                self.set_state(if self.connectivity == Connectivity::Disconnected {
                    State::Connecting
                } else {
                    State::Joined
                });
                self.apply_self_locally();
                self.maybe_send_muted_update(was_mute_state);
                match JoinResponse::parse(&ack.params_json) {
                    Ok(response) => self.apply_join_response(&response),
                    Err(error) => {
                        error!(target: "call.actor", %error, "Join response parse failed");
                    }
                }
                self.drain_queued_self_updates();
                self.check_first_time_joined();
                self.send_self_update(SelfEditKind::VideoMuted);
                info!(target: "call.actor", ssrc, "Join confirmed");
            }
            Err(error) => {
                warn!(target: "call.actor", reason = %error.reason, "Join failed");
                if error.reason == reasons::SSRC_DUPLICATE_MUCH {
                    // Collision is expected to resolve with a new payload.
                    self.rejoin();
                    return;
                }
                self.delegate
                    .join_failed(JoinFailure::from_reason(&error.reason));
                self.finish(FinishKind::Ended);
            }
        }
    }

    fn apply_join_response(&mut self, response: &JoinResponse) {
        let Some(engine) = self.engine.clone() else {
            return;
        };
        if response.stream {
            self.connection_mode = ConnectionMode::BroadcastRelay;
            engine.set_connection_mode(ConnectionMode::BroadcastRelay);
        } else if let Some(transport) = &response.transport {
            self.connection_mode = ConnectionMode::Direct;
            engine.set_connection_mode(ConnectionMode::Direct);
            engine.set_join_response(transport.clone());
        } else {
            warn!(target: "call.actor", "Join response carries no transport");
        }
    }

    fn ensure_engine(&mut self) -> Arc<dyn MediaEngine> {
        if let Some(engine) = &self.engine {
            return engine.clone();
        }
        info!(target: "call.actor", "Creating media engine");
        let descriptor = EngineDescriptor {
            audio_input_id: self.config.audio_input_id.clone(),
            audio_output_id: self.config.audio_output_id.clone(),
            video_input_id: self.config.video_input_id.clone(),
            outgoing_video_active: self.video_active,
            events: self.engine_events_tx.clone(),
        };
        let engine = self.engine_factory.create(descriptor);
        engine.set_muted(engine_muted(self.muted()));
        self.engine = Some(engine.clone());
        engine
    }

    fn check_first_time_joined(&mut self) {
        if self.had_joined || self.state() != State::Joined {
            return;
        }
        self.had_joined = true;
        self.delegate.play_sound(CallSound::Started);
    }

    fn notify_allowed_to_speak(&self) {
        if !self.had_joined {
            return;
        }
        self.delegate.play_sound(CallSound::AllowedToSpeak);
        self.delegate.allowed_to_speak();
    }

    fn rejoin_with_hash(&mut self, hash: String) {
        if hash.is_empty()
            || !matches!(self.muted(), MuteState::ForceMuted | MuteState::RaisedHand)
        {
            return;
        }
        self.invite_hash = Some(hash);
        self.rejoin();
    }

    fn rejoin_as(&mut self, join_as: PeerId) {
        if join_as == self.join_as {
            return;
        }
        if self.scheduled_start.is_some() {
            self.join_as = join_as;
            return;
        }
        self.set_state(State::Joining);
        self.rejoin_with(join_as);
    }

    // ---- Watchdog ----

    fn check_joined(&mut self) {
        if self.state() != State::Connecting || self.my_ssrc == 0 {
            return;
        }
        let Some(call) = self.call else {
            return;
        };
        debug!(target: "call.actor", ssrc = self.my_ssrc, "Checking join liveness");
        let ssrcs = vec![self.my_ssrc];
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.check_call(call, ssrcs).await;
            let _ = sender.send(CallMessage::CheckCallFinished { result }).await;
        });
    }

    fn check_call_finished(&mut self, result: Result<Vec<u32>, RequestError>) {
        match result {
            Ok(ssrcs) => {
                if self.my_ssrc != 0 && !ssrcs.contains(&self.my_ssrc) {
                    warn!(target: "call.actor", "Server dropped our join, rejoining");
                    self.rejoin();
                } else if self.state() == State::Connecting {
                    self.check_joined_deadline = Some(Instant::now() + CHECK_JOINED_TIMEOUT);
                }
            }
            Err(error) => {
                warn!(
                    target: "call.actor",
                    reason = %error.reason,
                    "Join liveness check failed, rejoining"
                );
                self.rejoin();
            }
        }
    }

    // ---- Roster synchronization ----

    fn handle_call_update(&mut self, update: CallUpdate) {
        match update {
            CallUpdate::Changed {
                id,
                schedule_date,
                record_start_date,
            } => {
                if self.call.map(|c| c.id) != Some(id) {
                    return;
                }
                self.record_start_date = record_start_date;
                let was_scheduled = self.scheduled_start.is_some();
                self.scheduled_start = schedule_date;
                if was_scheduled && self.scheduled_start.is_none() {
                    info!(target: "call.actor", call_id = id, "Scheduled call went live");
                    self.set_state(State::Joining);
                    self.rejoin();
                }
            }
            CallUpdate::Discarded { id } => {
                if self.call.map(|c| c.id) != Some(id) {
                    return;
                }
                info!(target: "call.actor", call_id = id, "Call discarded server-side");
                self.finish(FinishKind::Ended);
            }
        }
    }

    fn handle_participant_updates(&mut self, call_id: u64, updates: Vec<ParticipantUpdate>) {
        if self.call.map(|c| c.id) != Some(call_id) {
            return;
        }
        for update in updates {
            let is_self = update.is_self || update.peer == self.join_as;
            if !is_self {
                self.apply_roster_entry(&update);
            } else if matches!(self.state(), State::Joined | State::Connecting) {
                self.handle_self_update(&update);
            } else {
                self.queued_self_updates.push_back(update);
            }
        }
    }

    fn drain_queued_self_updates(&mut self) {
        while matches!(self.state(), State::Joined | State::Connecting) {
            let Some(update) = self.queued_self_updates.pop_front() else {
                break;
            };
            self.handle_self_update(&update);
        }
    }

    fn handle_self_update(&mut self, update: &ParticipantUpdate) {
        if update.left {
            self.apply_roster_entry(update);
            if update.ssrc == self.my_ssrc {
                info!(target: "call.actor", "Removed from the call, rejoining");
                self.set_state(State::Joining);
                self.rejoin();
            }
            return;
        }
        if update.ssrc != self.my_ssrc {
            if self.my_ssrcs.contains(&update.ssrc) {
                debug!(target: "call.actor", ssrc = update.ssrc, "Stale self update echo");
            } else {
                info!(target: "call.actor", "Joined from another device, hanging up");
                self.finish(FinishKind::Ended);
            }
            return;
        }

        self.apply_roster_entry(update);

        if update.muted && !update.can_self_unmute {
            let raised = update.raise_hand_rating.unwrap_or(0) != 0;
            self.set_muted(if raised {
                MuteState::RaisedHand
            } else {
                MuteState::ForceMuted
            });
        } else if self.connection_mode == ConnectionMode::BroadcastRelay {
            // Allowed to speak now: the relay cannot carry our audio.
            info!(target: "call.actor", "Allowed to speak, rejoining for RTC");
            self.set_state(State::Joining);
            self.rejoin();
        } else if matches!(self.muted(), MuteState::ForceMuted | MuteState::RaisedHand) {
            self.set_muted(MuteState::Muted);
            if !self.transitioning_from_relay {
                self.notify_allowed_to_speak();
            }
        } else if update.muted && self.muted() != MuteState::Muted {
            self.set_muted(MuteState::Muted);
        }
    }

    /// Shared data path for local and network roster entries.
    fn apply_roster_entry(&mut self, update: &ParticipantUpdate) {
        let diff = self.roster.apply(update);
        self.react_to_diff(update, &diff);
    }

    fn react_to_diff(&mut self, update: &ParticipantUpdate, diff: &ParticipantDiff) {
        if let (Some(was), None) = (&diff.was, &diff.now) {
            if was.ssrc != 0 {
                if let Some(engine) = &self.engine {
                    engine.remove_sources(vec![was.ssrc]);
                }
            }
        }

        if let Some(now) = &diff.now {
            let volume_changed = match &diff.was {
                Some(was) => was.volume != now.volume || was.muted_by_me != now.muted_by_me,
                None => now.volume != DEFAULT_VOLUME || now.muted_by_me,
            };
            if volume_changed && now.ssrc != 0 && !update.is_self && now.peer != self.join_as {
                let volume = if now.muted_by_me {
                    0.0
                } else {
                    f64::from(now.volume) / f64::from(DEFAULT_VOLUME)
                };
                if let Some(engine) = &self.engine {
                    engine.set_volume(now.ssrc, volume);
                }
                if !update.minimal {
                    self.delegate.other_participant_state(OtherParticipantState {
                        peer: now.peer,
                        volume: now.volume,
                        muted_by_me: now.muted_by_me,
                    });
                }
            }
        }

        let outcome = self.streams.on_participant_diff(diff, &self.roster);
        self.apply_streams_outcome(outcome);
    }

    // ---- Mute / volume propagation ----

    fn set_muted(&mut self, mute: MuteState) {
        let previous = self.muted();
        if previous == mute {
            return;
        }
        let was_muted = matches!(previous, MuteState::Muted | MuteState::PushToTalk);
        let was_raised = previous == MuteState::RaisedHand;
        self.mute_tx.send_replace(mute);
        let now_muted = matches!(mute, MuteState::Muted | MuteState::PushToTalk);
        let now_raised = mute == MuteState::RaisedHand;
        if was_muted != now_muted || was_raised != now_raised {
            self.apply_self_locally();
        }
        if let Some(engine) = &self.engine {
            engine.set_muted(engine_muted(mute));
        }
        // The very first server mute update is deferred until joined;
        // switching to Active always updates.
        if self.my_ssrc != 0 && (!self.initial_mute_sent || mute == MuteState::Active) {
            self.initial_mute_sent = true;
            self.maybe_send_muted_update(previous);
        }
    }

    fn set_muted_and_update(&mut self, mute: MuteState) {
        let was = self.muted();
        // Active transitions are already sent from set_muted.
        let send = self.initial_mute_sent && mute != MuteState::Active;
        self.set_muted(mute);
        if send {
            self.maybe_send_muted_update(was);
        }
    }

    fn maybe_send_muted_update(&mut self, previous: MuteState) {
        if let Some(kind) = muted_update_kind(previous, self.muted()) {
            self.send_self_update(kind);
        }
    }

    fn send_self_update(&mut self, kind: SelfEditKind) {
        let Some(call) = self.call else {
            return;
        };
        if let Some(task) = self.pending_self_edit.take() {
            // One outstanding edit at a time; newer state wins.
            task.abort();
        }
        self.self_edit_seq += 1;
        let seq = self.self_edit_seq;
        let request = SelfEditRequest {
            call,
            join_as: self.join_as,
            kind,
            muted: wire_muted(self.muted()),
            raise_hand: self.muted() == MuteState::RaisedHand,
            video_muted: !self.video_active,
        };
        debug!(target: "call.actor", ?kind, seq, "Sending self update");
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        self.pending_self_edit = Some(tokio::spawn(async move {
            let result = signaling.edit_self(request).await;
            let _ = sender
                .send(CallMessage::SelfEditFinished { seq, result })
                .await;
        }));
    }

    fn self_edit_finished(&mut self, seq: u64, result: Result<(), RequestError>) {
        if seq != self.self_edit_seq {
            return;
        }
        self.pending_self_edit = None;
        if let Err(error) = result {
            if error.reason == reasons::FORBIDDEN {
                warn!(target: "call.actor", "Self update forbidden, rejoining");
                self.rejoin();
            } else {
                warn!(target: "call.actor", reason = %error.reason, "Self update failed");
            }
        }
    }

    fn apply_self_locally(&mut self) {
        let mute = self.muted();
        let existing = self.roster.get(self.join_as).cloned();
        let raise_hand_rating = if mute == MuteState::RaisedHand {
            let kept = existing.as_ref().map_or(0, |p| p.raise_hand_rating);
            Some(if kept != 0 {
                kept
            } else {
                self.roster.max_raise_hand_rating() + 1
            })
        } else {
            None
        };
        let update = ParticipantUpdate {
            peer: self.join_as,
            is_self: true,
            left: false,
            minimal: false,
            ssrc: self.my_ssrc,
            muted: wire_muted(mute),
            can_self_unmute: !matches!(mute, MuteState::ForceMuted | MuteState::RaisedHand),
            muted_by_you: false,
            video_muted: !self.video_active,
            volume: existing.as_ref().map(|p| p.volume),
            raise_hand_rating,
            video_params: existing.as_ref().and_then(|p| p.video_params.clone()),
            joined_date: existing
                .as_ref()
                .map_or_else(|| Utc::now().timestamp(), |p| p.joined_date),
            last_active: existing.as_ref().map_or(0, |p| p.last_active),
        };
        self.apply_roster_entry(&update);
    }

    fn apply_participant_locally(&mut self, peer: PeerId, mute: bool, volume: Option<i32>) {
        let Some(participant) = self.roster.get(peer).cloned() else {
            return;
        };
        if participant.ssrc == 0 {
            return;
        }
        let can_manage = self.permissions.can_manage;
        let update = ParticipantUpdate {
            peer,
            is_self: false,
            left: false,
            minimal: false,
            ssrc: participant.ssrc,
            // Admin mutes are authoritative; anyone else only mutes
            // their own playback.
            muted: participant.muted || (mute && can_manage),
            can_self_unmute: if can_manage {
                !mute || self.permissions.admins.contains(&peer)
            } else {
                participant.can_self_unmute
            },
            muted_by_you: mute && !can_manage,
            video_muted: participant.video_muted,
            volume: Some(volume.unwrap_or(participant.volume)),
            raise_hand_rating: (participant.raise_hand_rating != 0)
                .then_some(participant.raise_hand_rating),
            video_params: participant.video_params.clone(),
            joined_date: participant.joined_date,
            last_active: participant.last_active,
        };
        self.apply_roster_entry(&update);
    }

    fn edit_participant(&mut self, peer: PeerId, mute: bool, volume: Option<i32>) {
        let Some(call) = self.call else {
            return;
        };
        let request = ParticipantEditRequest {
            call,
            participant: peer,
            muted: mute,
            volume,
        };
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.edit_participant(request).await;
            let _ = sender
                .send(CallMessage::ParticipantEditFinished { result })
                .await;
        });
    }

    // ---- Push-to-talk / video ----

    fn push_to_talk(&mut self, pressed: bool) {
        if matches!(
            self.muted(),
            MuteState::ForceMuted | MuteState::RaisedHand | MuteState::Active
        ) {
            return;
        }
        if pressed {
            self.ptt_deadline = None;
            self.set_muted(MuteState::PushToTalk);
        } else if self.config.push_to_talk_delay > Duration::ZERO {
            self.ptt_deadline = Some(Instant::now() + self.config.push_to_talk_delay);
        } else {
            self.push_to_talk_timeout();
        }
    }

    fn push_to_talk_timeout(&mut self) {
        self.ptt_deadline = None;
        if self.muted() == MuteState::PushToTalk {
            self.set_muted(MuteState::Muted);
        }
    }

    fn toggle_video(&mut self, active: bool) {
        if self.video_active == active {
            return;
        }
        self.video_active = active;
        if let Some(engine) = &self.engine {
            engine.set_outgoing_video_active(active);
        }
        self.apply_self_locally();
        self.send_self_update(SelfEditKind::VideoMuted);
    }

    fn pin_video_stream(&mut self, ssrc: u32) {
        if self.streams.pin(ssrc) {
            self.push_large_video();
        }
    }

    // ---- Supplemental operations ----

    fn discard(&mut self) {
        let Some(call) = self.call else {
            self.finish(FinishKind::Ended);
            return;
        };
        info!(target: "call.actor", call_id = call.id, "Discarding group call");
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.discard_call(call).await;
            let _ = sender.send(CallMessage::DiscardFinished { result }).await;
        });
    }

    fn start_scheduled_now(&mut self) {
        if self.scheduled_start.is_none() || !self.permissions.can_manage {
            return;
        }
        let Some(call) = self.call else {
            return;
        };
        info!(target: "call.actor", call_id = call.id, "Starting scheduled call now");
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.start_scheduled(call).await {
                warn!(target: "call.actor", reason = %error.reason, "Start scheduled failed");
            }
        });
    }

    fn toggle_start_subscription(&mut self, subscribed: bool) {
        let Some(call) = self.call else {
            return;
        };
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.toggle_start_subscription(call, subscribed).await {
                warn!(
                    target: "call.actor",
                    reason = %error.reason,
                    "Start subscription toggle failed"
                );
            }
        });
    }

    fn invite(&mut self, users: Vec<PeerId>) {
        let Some(call) = self.call else {
            return;
        };
        let fresh: Vec<PeerId> = users
            .into_iter()
            .filter(|peer| self.roster.get(*peer).is_none())
            .collect();
        for chunk in fresh.chunks(INVITE_SLICE) {
            let slice = chunk.to_vec();
            let signaling = self.signaling.clone();
            tokio::spawn(async move {
                if let Err(error) = signaling.invite(call, slice).await {
                    warn!(target: "call.actor", reason = %error.reason, "Invite failed");
                }
            });
        }
    }

    fn edit_title(&mut self, title: String) {
        let Some(call) = self.call else {
            return;
        };
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            if let Err(error) = signaling.edit_title(call, title).await {
                warn!(target: "call.actor", reason = %error.reason, "Title edit failed");
            }
        });
    }

    fn toggle_recording(&mut self, start: bool, title: Option<String>) {
        let Some(call) = self.call else {
            return;
        };
        if self.record_start_date.is_some() == start {
            return;
        }
        if !start {
            self.recording_stopped_by_me = true;
        }
        info!(target: "call.actor", start, "Toggling recording");
        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let result = signaling.toggle_recording(call, start, title).await;
            let _ = sender
                .send(CallMessage::RecordingToggleFinished { result })
                .await;
        });
    }

    // ---- Engine events ----

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::NetworkStateChanged(network) => self.set_engine_connectivity(network),
            EngineEvent::AudioLevels(updates) => self.handle_audio_levels(&updates),
            EngineEvent::IncomingVideoSources(ssrcs) => {
                let outcome = self.streams.set_streaming(&ssrcs, &self.roster);
                self.apply_streams_outcome(outcome);
            }
            EngineEvent::BroadcastPartRequested(request) => self.broadcast_part_start(request),
        }
    }

    fn set_engine_connectivity(&mut self, network: NetworkState) {
        let connectivity = network.connectivity();
        let in_transit = network.transitioning_from_relay;
        if self.connectivity == connectivity && self.transitioning_from_relay == in_transit {
            return;
        }
        let connected = connectivity != Connectivity::Disconnected;
        let now_can_speak = connected
            && self.transitioning_from_relay
            && !in_transit
            && self.muted() == MuteState::Muted;
        self.connectivity = connectivity;
        self.transitioning_from_relay = in_transit;
        debug!(target: "call.actor", ?connectivity, "Engine connectivity changed");

        if self.state() == State::Connecting && connected {
            self.set_state(State::Joined);
        } else if self.state() == State::Joined && !connected {
            self.set_state(State::Connecting);
        }
        if now_can_speak {
            self.notify_allowed_to_speak();
        }
        self.check_first_time_joined();

        if self.had_joined {
            if connected {
                self.connecting_sound_deadline = None;
            } else if self.connecting_sound_deadline.is_none() {
                self.delegate.play_sound(CallSound::Connecting);
                self.connecting_sound_deadline = Some(Instant::now() + CONNECTING_SOUND_EACH);
            }
        }
    }

    fn handle_audio_levels(&mut self, updates: &[LevelUpdate]) {
        if self.activity.suppress_own_silence(updates) {
            return;
        }
        for update in updates {
            let ssrc = if update.ssrc == 0 {
                self.my_ssrc
            } else {
                update.ssrc
            };
            self.delegate.level_updated(LevelUpdate {
                ssrc,
                level: update.level,
                voice: update.voice,
            });
        }
        let now_ms = self.now_ms();
        let outcome = self.activity.register(updates, self.my_ssrc, now_ms);
        if outcome.send_speaking_progress {
            if let Some(call) = self.call {
                let signaling = self.signaling.clone();
                tokio::spawn(async move {
                    signaling.send_speaking_progress(call).await;
                });
            }
        }
        if outcome.check_now {
            self.check_last_spoke();
        } else if outcome.schedule_check && self.last_spoke_deadline.is_none() {
            self.last_spoke_deadline = Some(
                Instant::now() + Duration::from_millis(CHECK_LAST_SPOKE_INTERVAL_MS as u64 / 2),
            );
        }
    }

    fn check_last_spoke(&mut self) {
        self.last_spoke_deadline = None;
        let now_ms = self.now_ms();
        let result = self.activity.check(now_ms);
        for (ssrc, times) in result.flushes {
            if let Some(diff) = self.roster.apply_last_spoke(ssrc, times, now_ms) {
                let outcome = self.streams.on_participant_diff(&diff, &self.roster);
                self.apply_streams_outcome(outcome);
            }
        }
        if result.has_recent {
            self.last_spoke_deadline = Some(
                Instant::now() + Duration::from_millis(CHECK_LAST_SPOKE_INTERVAL_MS as u64 / 3),
            );
        }
    }

    fn apply_streams_outcome(&mut self, outcome: StreamsOutcome) {
        for event in outcome.events {
            self.delegate.streams_video_updated(event.ssrc, event.streaming);
        }
        if outcome.large_changed {
            self.push_large_video();
        }
    }

    fn push_large_video(&mut self) {
        let large = self.streams.large();
        self.large_tx.send_replace(large);
        if let Some(engine) = &self.engine {
            engine.set_full_size_video_source(large);
        }
    }

    // ---- Broadcast parts ----

    fn broadcast_part_start(&mut self, request: Arc<BroadcastPartRequest>) {
        if request.is_delivered() {
            return;
        }
        let Some(call) = self.call else {
            request.cancel();
            return;
        };
        let time_ms = request.time_ms();
        let scale_index = request.scale().index();
        debug!(target: "call.actor", time_ms, scale = scale_index, "Fetching broadcast part");
        let token = request.cancelled().clone();
        self.outstanding_parts.insert((time_ms, scale_index), request);

        let signaling = self.signaling.clone();
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = token.cancelled() => PartFetchOutcome::Cancelled,
                result = signaling.fetch_stream_part(
                    call, time_ms, scale_index, STREAM_PART_LIMIT,
                ) => match result {
                    Ok(response) => PartFetchOutcome::Response(response),
                    Err(error) => PartFetchOutcome::Failed(error),
                },
            };
            let _ = sender
                .send(CallMessage::PartFetchFinished {
                    time_ms,
                    scale_index,
                    outcome,
                })
                .await;
        });
    }

    fn part_fetch_finished(&mut self, time_ms: i64, scale_index: i32, outcome: PartFetchOutcome) {
        let Some(request) = self.outstanding_parts.remove(&(time_ms, scale_index)) else {
            return;
        };
        match outcome {
            PartFetchOutcome::Cancelled => {}
            PartFetchOutcome::Response(PartFetchResponse::Bytes(fetch)) => {
                request.complete(BroadcastPart {
                    timestamp_ms: time_ms,
                    response_timestamp_ms: response_timestamp_ms(fetch.msg_id),
                    status: PartStatus::Success,
                    payload: fetch.bytes,
                });
            }
            PartFetchOutcome::Response(PartFetchResponse::CdnRedirect { msg_id }) => {
                warn!(target: "call.actor", time_ms, "CDN redirect on stream part");
                request.complete(BroadcastPart {
                    timestamp_ms: time_ms,
                    response_timestamp_ms: response_timestamp_ms(msg_id),
                    status: PartStatus::ResyncNeeded,
                    payload: Bytes::new(),
                });
            }
            PartFetchOutcome::Failed(error) => match classify_fetch_error(&error) {
                PartFetchError::Invalidated => {
                    warn!(
                        target: "call.actor",
                        reason = %error.reason,
                        "Stream part fetch invalidated the join, rejoining"
                    );
                    request.cancel();
                    self.cancel_outstanding_parts();
                    self.set_state(State::Joining);
                    self.rejoin();
                }
                PartFetchError::NotReady => {
                    request.complete(BroadcastPart {
                        timestamp_ms: time_ms,
                        response_timestamp_ms: 0.0,
                        status: PartStatus::NotReady,
                        payload: Bytes::new(),
                    });
                }
                PartFetchError::ResyncNeeded => {
                    request.complete(BroadcastPart {
                        timestamp_ms: time_ms,
                        response_timestamp_ms: 0.0,
                        status: PartStatus::ResyncNeeded,
                        payload: Bytes::new(),
                    });
                }
            },
        }
    }

    fn cancel_outstanding_parts(&mut self) {
        for (_, request) in self.outstanding_parts.drain() {
            request.cancel();
        }
    }
}
