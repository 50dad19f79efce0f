//! Signaling transport seam.
//!
//! Everything the orchestrator asks of the signaling service goes through
//! the [`SignalingApi`] trait; everything the service pushes back enters
//! through `GroupCallHandle::handle_call_update` /
//! `handle_participant_updates`. The wire encoding behind the trait is the
//! transport's business.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RequestError;
use crate::payload::VideoParams;

/// Numeric peer identity (user or channel) as issued by the service.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub i64);

/// Reference to a group call: id plus access hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRef {
    pub id: u64,
    pub access_hash: u64,
}

/// A join (or rejoin) request.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub call: CallRef,
    /// Identity to join as.
    pub join_as: PeerId,
    /// Invite-link hash, when joining through one.
    pub invite_hash: Option<String>,
    /// Whether we join with the microphone muted.
    pub muted: bool,
    /// Serialized [`crate::payload::JoinPayload`].
    pub payload_json: String,
}

/// Acknowledgement of a join request.
#[derive(Debug, Clone)]
pub struct JoinAck {
    /// Serialized [`crate::payload::JoinResponse`].
    pub params_json: String,
}

/// Which self flag an edit-self request changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfEditKind {
    Mute,
    RaiseHand,
    VideoMuted,
}

/// An edit of our own participant entry.
#[derive(Debug, Clone)]
pub struct SelfEditRequest {
    pub call: CallRef,
    pub join_as: PeerId,
    pub kind: SelfEditKind,
    pub muted: bool,
    pub raise_hand: bool,
    pub video_muted: bool,
}

/// An edit of another participant's entry.
#[derive(Debug, Clone)]
pub struct ParticipantEditRequest {
    pub call: CallRef,
    pub participant: PeerId,
    pub muted: bool,
    /// New volume, when the edit changes it.
    pub volume: Option<i32>,
}

/// One fetched broadcast stream segment.
#[derive(Debug, Clone)]
pub struct PartFetch {
    pub bytes: Bytes,
    /// Transport message id of the response; carries the server time.
    pub msg_id: u64,
}

/// Outcome of a stream segment fetch that reached the server.
#[derive(Debug, Clone)]
pub enum PartFetchResponse {
    /// Segment data.
    Bytes(PartFetch),
    /// The server redirected to a CDN; the caller must resynchronize.
    CdnRedirect { msg_id: u64 },
}

/// Call-level server event.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    /// Call parameters changed.
    Changed {
        id: u64,
        /// Scheduled start time; `None` once the call is live.
        schedule_date: Option<DateTime<Utc>>,
        /// Unix time recording started at, if recording.
        record_start_date: Option<i64>,
    },
    /// The call was discarded server-side.
    Discarded { id: u64 },
}

/// One roster delta entry as pushed by the service.
#[derive(Debug, Clone, Default)]
pub struct ParticipantUpdate {
    pub peer: PeerId,
    /// Whether this entry describes the local identity.
    pub is_self: bool,
    /// Participant left (or was removed from) the call.
    pub left: bool,
    /// Minimal update: presence only, no authoritative volume or
    /// muted-by-me flags.
    pub minimal: bool,
    pub ssrc: u32,
    pub muted: bool,
    pub can_self_unmute: bool,
    pub muted_by_you: bool,
    pub video_muted: bool,
    /// Playback volume in 0..=20000, when the update carries one.
    pub volume: Option<i32>,
    /// Raised-hand ordering rating, when the hand is raised.
    pub raise_hand_rating: Option<u64>,
    pub video_params: Option<VideoParams>,
    /// Unix time the participant joined at.
    pub joined_date: i64,
    /// Unix time of last activity, zero when unknown.
    pub last_active: i64,
}

/// Client side of the signaling service.
///
/// Every method is a single round-trip; completions are marshalled back
/// into the call actor by the caller.
#[async_trait]
pub trait SignalingApi: Send + Sync {
    /// Create a new group call, optionally scheduled.
    async fn create_call(
        &self,
        random_id: i32,
        schedule_date: Option<DateTime<Utc>>,
    ) -> Result<CallRef, RequestError>;

    /// Join (or rejoin) a call with a fresh payload.
    async fn join_call(&self, request: JoinRequest) -> Result<JoinAck, RequestError>;

    /// Leave the call, confirming the ssrc we held.
    async fn leave_call(&self, call: CallRef, ssrc: u32) -> Result<(), RequestError>;

    /// Discard the call for everyone.
    async fn discard_call(&self, call: CallRef) -> Result<(), RequestError>;

    /// Edit our own participant entry.
    async fn edit_self(&self, request: SelfEditRequest) -> Result<(), RequestError>;

    /// Edit another participant's entry.
    async fn edit_participant(&self, request: ParticipantEditRequest) -> Result<(), RequestError>;

    /// Invite users into the call.
    async fn invite(&self, call: CallRef, users: Vec<PeerId>) -> Result<(), RequestError>;

    /// Change the call title.
    async fn edit_title(&self, call: CallRef, title: String) -> Result<(), RequestError>;

    /// Start or stop server-side recording.
    async fn toggle_recording(
        &self,
        call: CallRef,
        start: bool,
        title: Option<String>,
    ) -> Result<(), RequestError>;

    /// Launch a scheduled call now.
    async fn start_scheduled(&self, call: CallRef) -> Result<(), RequestError>;

    /// Subscribe to / unsubscribe from the scheduled start notification.
    async fn toggle_start_subscription(
        &self,
        call: CallRef,
        subscribed: bool,
    ) -> Result<(), RequestError>;

    /// Ask the server which of `ssrcs` it still considers part of the
    /// call; returns the subset that is.
    async fn check_call(&self, call: CallRef, ssrcs: Vec<u32>) -> Result<Vec<u32>, RequestError>;

    /// Fetch one broadcast stream segment.
    async fn fetch_stream_part(
        &self,
        call: CallRef,
        time_ms: i64,
        scale: i32,
        limit: i32,
    ) -> Result<PartFetchResponse, RequestError>;

    /// Best-effort "speaking" activity signal toward the chat.
    async fn send_speaking_progress(&self, call: CallRef);
}
