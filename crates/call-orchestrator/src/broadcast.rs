//! Broadcast stream part loading.
//!
//! When the call is consumed as a broadcast relay the media engine pulls
//! stream segments through the orchestrator. Each pull is a
//! [`BroadcastPartRequest`]: the engine may cancel it and the network may
//! complete it concurrently, so delivery is guarded by an atomic
//! already-delivered flag and exactly one of the two wins.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::errors::{reasons, RequestError};

/// Segment fetch size limit, matching the stream server's chunking.
pub const STREAM_PART_LIMIT: i32 = 128 * 1024;

/// Segment duration scale. The wire carries the scale as a power-of-two
/// divisor index of the full 1000 ms segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartScale {
    /// 1000 ms segments.
    Full,
    /// 500 ms segments.
    Half,
    /// 250 ms segments.
    Quarter,
    /// 125 ms segments.
    Eighth,
}

impl PartScale {
    /// Map a segment duration in milliseconds onto a scale.
    #[must_use]
    pub fn from_period_ms(period_ms: i64) -> Option<Self> {
        match period_ms {
            1000 => Some(Self::Full),
            500 => Some(Self::Half),
            250 => Some(Self::Quarter),
            125 => Some(Self::Eighth),
            _ => None,
        }
    }

    /// Wire index of this scale.
    #[must_use]
    pub fn index(self) -> i32 {
        match self {
            Self::Full => 0,
            Self::Half => 1,
            Self::Quarter => 2,
            Self::Eighth => 3,
        }
    }

    /// Segment duration in milliseconds.
    #[must_use]
    pub fn period_ms(self) -> i64 {
        match self {
            Self::Full => 1000,
            Self::Half => 500,
            Self::Quarter => 250,
            Self::Eighth => 125,
        }
    }
}

/// Status delivered to the engine along with a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Segment data is present.
    Success,
    /// The segment is not available yet; the engine should retry later.
    NotReady,
    /// The engine must resynchronize its stream position.
    ResyncNeeded,
}

/// One delivered broadcast part.
#[derive(Debug, Clone)]
pub struct BroadcastPart {
    /// Requested segment timestamp, unix ms.
    pub timestamp_ms: i64,
    /// Server time of the response, ms (fractional), zero when unknown.
    pub response_timestamp_ms: f64,
    pub status: PartStatus,
    pub payload: Bytes,
}

/// Server time carried in a transport message id, in milliseconds.
///
/// The high 32 bits of a message id are unix seconds.
#[must_use]
pub fn response_timestamp_ms(msg_id: u64) -> f64 {
    (msg_id as f64 / (1u64 << 32) as f64) * 1000.0
}

/// How a failed segment fetch is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartFetchError {
    /// Our join is gone; all outstanding fetches are dropped and the call
    /// rejoins.
    Invalidated,
    /// Transient; the segment is reported as not ready.
    NotReady,
    /// The engine must resynchronize.
    ResyncNeeded,
}

/// Classify a segment fetch failure.
#[must_use]
pub fn classify_fetch_error(error: &RequestError) -> PartFetchError {
    if error.reason == reasons::JOIN_MISSING || error.reason == reasons::FORBIDDEN {
        PartFetchError::Invalidated
    } else if error.is_flood() || error.reason == reasons::TIME_TOO_BIG {
        PartFetchError::NotReady
    } else {
        PartFetchError::ResyncNeeded
    }
}

type PartCallback = Box<dyn FnOnce(BroadcastPart) + Send + 'static>;

/// A single engine-initiated segment pull.
///
/// The request is shared between the engine (which may cancel it) and the
/// call actor (which completes it when the fetch finishes). Whichever
/// side claims the delivery flag first wins; the other call is a no-op.
pub struct BroadcastPartRequest {
    time_ms: i64,
    scale: PartScale,
    delivered: AtomicBool,
    callback: Mutex<Option<PartCallback>>,
    cancelled: CancellationToken,
}

impl fmt::Debug for BroadcastPartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastPartRequest")
            .field("time_ms", &self.time_ms)
            .field("scale", &self.scale)
            .field("delivered", &self.delivered.load(Ordering::Acquire))
            .finish()
    }
}

impl BroadcastPartRequest {
    /// Create a request for the segment at `time_ms` with the given
    /// segment duration. A zero timestamp means "now". Returns `None`
    /// for an unsupported duration.
    pub fn new(
        time_ms: i64,
        period_ms: i64,
        done: impl FnOnce(BroadcastPart) + Send + 'static,
    ) -> Option<Self> {
        let scale = PartScale::from_period_ms(period_ms)?;
        let time_ms = if time_ms == 0 {
            Utc::now().timestamp_millis()
        } else {
            time_ms
        };
        Some(Self {
            time_ms,
            scale,
            delivered: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(done))),
            cancelled: CancellationToken::new(),
        })
    }

    /// Requested segment timestamp, unix ms.
    #[must_use]
    pub fn time_ms(&self) -> i64 {
        self.time_ms
    }

    /// Requested segment scale.
    #[must_use]
    pub fn scale(&self) -> PartScale {
        self.scale
    }

    /// Token fired when the engine cancels the request; the actor aborts
    /// the in-flight fetch on it.
    #[must_use]
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancelled
    }

    /// Whether the request has already been delivered or cancelled.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    /// Claim the one-shot completion. The atomic is the delivery guard;
    /// the mutex only ferries the callback out.
    fn claim(&self) -> Option<PartCallback> {
        if self.delivered.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut slot = match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }

    /// Deliver the part to the engine. Returns `false` when the request
    /// was already delivered or cancelled.
    pub fn complete(&self, part: BroadcastPart) -> bool {
        match self.claim() {
            Some(callback) => {
                callback(part);
                true
            }
            None => false,
        }
    }

    /// Cancel the request. Returns `false` when a delivery already won.
    pub fn cancel(&self) -> bool {
        match self.claim() {
            Some(callback) => {
                drop(callback);
                self.cancelled.cancel();
                true
            }
            None => false,
        }
    }
}
