//! Scripted signaling service for call-actor testing.
//!
//! Every request is recorded; responses come from per-method scripts
//! (front-to-back) and fall back to benign defaults when the script runs
//! dry. Optional per-method delays pair with a paused tokio clock so a
//! test controls exactly when a round-trip completes.
//!
//! # Example
//!
//! ```rust,ignore
//! use call_test_utils::MockSignaling;
//!
//! let signaling = MockSignaling::new();
//! signaling.push_join_err("GROUPCALL_SSRC_DUPLICATE_MUCH");
//!
//! // First join fails with the collision, the retry succeeds.
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use call_orchestrator::errors::RequestError;
use call_orchestrator::signaling::{
    CallRef, JoinAck, JoinRequest, ParticipantEditRequest, PartFetch, PartFetchResponse, PeerId,
    SelfEditRequest, SignalingApi,
};

/// Default join-response parameters: a direct RTC transport.
pub const DIRECT_JOIN_PARAMS: &str = r#"{
    "transport": {
        "ufrag": "server-uf",
        "pwd": "server-pw",
        "fingerprints": [
            {"hash": "sha-256", "setup": "passive", "fingerprint": "AA:BB:CC"}
        ],
        "candidates": [
            {"port": "3478", "protocol": "udp", "ip": "10.0.0.1", "type": "host"}
        ]
    }
}"#;

/// Join-response parameters selecting the broadcast relay.
pub const STREAM_JOIN_PARAMS: &str = r#"{"stream": true}"#;

/// One recorded signaling request.
#[derive(Debug, Clone)]
pub enum Recorded {
    Create { scheduled: bool },
    Join(JoinRequest),
    Leave { call: CallRef, ssrc: u32 },
    Discard { call: CallRef },
    EditSelf(SelfEditRequest),
    EditParticipant(ParticipantEditRequest),
    Invite { call: CallRef, users: Vec<PeerId> },
    EditTitle { call: CallRef, title: String },
    ToggleRecording { start: bool, title: Option<String> },
    StartScheduled { call: CallRef },
    ToggleStartSubscription { subscribed: bool },
    CheckCall { ssrcs: Vec<u32> },
    FetchPart { time_ms: i64, scale: i32, limit: i32 },
    SpeakingProgress { call: CallRef },
}

#[derive(Default)]
struct Scripts {
    create: VecDeque<Result<CallRef, RequestError>>,
    join: VecDeque<Result<JoinAck, RequestError>>,
    self_edit: VecDeque<Result<(), RequestError>>,
    participant_edit: VecDeque<Result<(), RequestError>>,
    check: VecDeque<Result<Vec<u32>, RequestError>>,
    part: VecDeque<Result<PartFetchResponse, RequestError>>,
    recording: VecDeque<Result<(), RequestError>>,
    discard: VecDeque<Result<(), RequestError>>,
}

#[derive(Default)]
struct Inner {
    scripts: Scripts,
    requests: Vec<Recorded>,
    join_delay: Option<Duration>,
    self_edit_delay: Option<Duration>,
    part_delay: Option<Duration>,
}

/// Scripted [`SignalingApi`] implementation.
#[derive(Default)]
pub struct MockSignaling {
    inner: Mutex<Inner>,
}

impl MockSignaling {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, recorded: Recorded) {
        self.lock().requests.push(recorded);
    }

    /// Everything requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Recorded> {
        self.lock().requests.clone()
    }

    /// All recorded join requests, in order.
    #[must_use]
    pub fn join_requests(&self) -> Vec<JoinRequest> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                Recorded::Join(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// All recorded self edits, in order.
    #[must_use]
    pub fn self_edits(&self) -> Vec<SelfEditRequest> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                Recorded::EditSelf(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// All recorded participant edits, in order.
    #[must_use]
    pub fn participant_edits(&self) -> Vec<ParticipantEditRequest> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                Recorded::EditParticipant(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// All recorded part fetches as `(time_ms, scale)`, in order.
    #[must_use]
    pub fn part_fetches(&self) -> Vec<(i64, i32)> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| match r {
                Recorded::FetchPart { time_ms, scale, .. } => Some((*time_ms, *scale)),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn leave_count(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, Recorded::Leave { .. }))
            .count()
    }

    #[must_use]
    pub fn check_count(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, Recorded::CheckCall { .. }))
            .count()
    }

    #[must_use]
    pub fn speaking_progress_count(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, Recorded::SpeakingProgress { .. }))
            .count()
    }

    pub fn push_create_ok(&self, call: CallRef) {
        self.lock().scripts.create.push_back(Ok(call));
    }

    pub fn push_create_err(&self, reason: &str) {
        self.lock()
            .scripts
            .create
            .push_back(Err(RequestError::new(reason)));
    }

    /// Script the next join to succeed with `params_json`.
    pub fn push_join_ok(&self, params_json: &str) {
        self.lock().scripts.join.push_back(Ok(JoinAck {
            params_json: params_json.to_string(),
        }));
    }

    /// Script the next join to fail with `reason`.
    pub fn push_join_err(&self, reason: &str) {
        self.lock()
            .scripts
            .join
            .push_back(Err(RequestError::new(reason)));
    }

    pub fn push_self_edit_err(&self, reason: &str) {
        self.lock()
            .scripts
            .self_edit
            .push_back(Err(RequestError::new(reason)));
    }

    pub fn push_participant_edit_err(&self, reason: &str) {
        self.lock()
            .scripts
            .participant_edit
            .push_back(Err(RequestError::new(reason)));
    }

    /// Script the next liveness check to return `ssrcs`.
    pub fn push_check_ok(&self, ssrcs: Vec<u32>) {
        self.lock().scripts.check.push_back(Ok(ssrcs));
    }

    pub fn push_check_err(&self, reason: &str) {
        self.lock()
            .scripts
            .check
            .push_back(Err(RequestError::new(reason)));
    }

    /// Script the next part fetch to return `bytes` stamped `msg_id`.
    pub fn push_part_bytes(&self, bytes: &'static [u8], msg_id: u64) {
        self.lock()
            .scripts
            .part
            .push_back(Ok(PartFetchResponse::Bytes(PartFetch {
                bytes: Bytes::from_static(bytes),
                msg_id,
            })));
    }

    pub fn push_part_redirect(&self, msg_id: u64) {
        self.lock()
            .scripts
            .part
            .push_back(Ok(PartFetchResponse::CdnRedirect { msg_id }));
    }

    pub fn push_part_err(&self, reason: &str) {
        self.lock()
            .scripts
            .part
            .push_back(Err(RequestError::new(reason)));
    }

    pub fn push_recording_err(&self, reason: &str) {
        self.lock()
            .scripts
            .recording
            .push_back(Err(RequestError::new(reason)));
    }

    pub fn push_discard_err(&self, reason: &str) {
        self.lock()
            .scripts
            .discard
            .push_back(Err(RequestError::new(reason)));
    }

    /// Delay every join round-trip; pairs with a paused clock.
    pub fn set_join_delay(&self, delay: Duration) {
        self.lock().join_delay = Some(delay);
    }

    /// Delay every self edit; pairs with a paused clock.
    pub fn set_self_edit_delay(&self, delay: Duration) {
        self.lock().self_edit_delay = Some(delay);
    }

    /// Delay every part fetch; pairs with a paused clock.
    pub fn set_part_fetch_delay(&self, delay: Duration) {
        self.lock().part_delay = Some(delay);
    }
}

#[async_trait]
impl SignalingApi for MockSignaling {
    async fn create_call(
        &self,
        _random_id: i32,
        schedule_date: Option<DateTime<Utc>>,
    ) -> Result<CallRef, RequestError> {
        self.record(Recorded::Create {
            scheduled: schedule_date.is_some(),
        });
        self.lock().scripts.create.pop_front().unwrap_or(Ok(CallRef {
            id: 1,
            access_hash: 1,
        }))
    }

    async fn join_call(&self, request: JoinRequest) -> Result<JoinAck, RequestError> {
        let delay = {
            let mut inner = self.lock();
            inner.requests.push(Recorded::Join(request));
            inner.join_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().scripts.join.pop_front().unwrap_or_else(|| {
            Ok(JoinAck {
                params_json: DIRECT_JOIN_PARAMS.to_string(),
            })
        })
    }

    async fn leave_call(&self, call: CallRef, ssrc: u32) -> Result<(), RequestError> {
        self.record(Recorded::Leave { call, ssrc });
        Ok(())
    }

    async fn discard_call(&self, call: CallRef) -> Result<(), RequestError> {
        self.record(Recorded::Discard { call });
        self.lock().scripts.discard.pop_front().unwrap_or(Ok(()))
    }

    async fn edit_self(&self, request: SelfEditRequest) -> Result<(), RequestError> {
        // The script entry is claimed up front so an aborted round-trip
        // still consumes it.
        let (result, delay) = {
            let mut inner = self.lock();
            inner.requests.push(Recorded::EditSelf(request));
            (inner.scripts.self_edit.pop_front(), inner.self_edit_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result.unwrap_or(Ok(()))
    }

    async fn edit_participant(&self, request: ParticipantEditRequest) -> Result<(), RequestError> {
        self.record(Recorded::EditParticipant(request));
        self.lock()
            .scripts
            .participant_edit
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn invite(&self, call: CallRef, users: Vec<PeerId>) -> Result<(), RequestError> {
        self.record(Recorded::Invite { call, users });
        Ok(())
    }

    async fn edit_title(&self, call: CallRef, title: String) -> Result<(), RequestError> {
        self.record(Recorded::EditTitle { call, title });
        Ok(())
    }

    async fn toggle_recording(
        &self,
        _call: CallRef,
        start: bool,
        title: Option<String>,
    ) -> Result<(), RequestError> {
        self.record(Recorded::ToggleRecording { start, title });
        self.lock().scripts.recording.pop_front().unwrap_or(Ok(()))
    }

    async fn start_scheduled(&self, call: CallRef) -> Result<(), RequestError> {
        self.record(Recorded::StartScheduled { call });
        Ok(())
    }

    async fn toggle_start_subscription(
        &self,
        _call: CallRef,
        subscribed: bool,
    ) -> Result<(), RequestError> {
        self.record(Recorded::ToggleStartSubscription { subscribed });
        Ok(())
    }

    async fn check_call(&self, _call: CallRef, ssrcs: Vec<u32>) -> Result<Vec<u32>, RequestError> {
        let scripted = {
            let mut inner = self.lock();
            inner.requests.push(Recorded::CheckCall {
                ssrcs: ssrcs.clone(),
            });
            inner.scripts.check.pop_front()
        };
        // Default: the server still knows every requested ssrc.
        scripted.unwrap_or(Ok(ssrcs))
    }

    async fn fetch_stream_part(
        &self,
        _call: CallRef,
        time_ms: i64,
        scale: i32,
        limit: i32,
    ) -> Result<PartFetchResponse, RequestError> {
        let delay = {
            let mut inner = self.lock();
            inner.requests.push(Recorded::FetchPart {
                time_ms,
                scale,
                limit,
            });
            inner.part_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().scripts.part.pop_front().unwrap_or_else(|| {
            Ok(PartFetchResponse::Bytes(PartFetch {
                bytes: Bytes::from_static(b"segment"),
                msg_id: 1 << 32,
            }))
        })
    }

    async fn send_speaking_progress(&self, call: CallRef) {
        self.record(Recorded::SpeakingProgress { call });
    }
}
