//! Group call error types.
//!
//! Signaling failures arrive as structured reason strings from the
//! transport. Join failures are mapped onto a small set of categories so
//! the embedder can show a meaningful message without knowing the wire
//! vocabulary.

use thiserror::Error;

/// Wire reason strings recognized by the orchestrator.
pub mod reasons {
    /// Our ssrc collided with another participant too many times.
    pub const SSRC_DUPLICATE_MUCH: &str = "GROUPCALL_SSRC_DUPLICATE_MUCH";

    /// Anonymous identities may not join or create this call.
    pub const ANONYMOUS_FORBIDDEN: &str = "GROUPCALL_ANONYMOUS_FORBIDDEN";

    /// The call is full.
    pub const PARTICIPANTS_TOO_MUCH: &str = "GROUPCALL_PARTICIPANTS_TOO_MUCH";

    /// We are not (or no longer) allowed to touch this call.
    pub const FORBIDDEN: &str = "GROUPCALL_FORBIDDEN";

    /// The server does not consider us joined.
    pub const JOIN_MISSING: &str = "GROUPCALL_JOIN_MISSING";

    /// Requested stream segment timestamp is ahead of the server.
    pub const TIME_TOO_BIG: &str = "TIME_TOO_BIG";

    /// Prefix of server-side rate limiting reasons.
    pub const FLOOD_WAIT_PREFIX: &str = "FLOOD_WAIT";
}

/// A failed signaling request.
///
/// The transport reports failures as reason strings; everything the
/// orchestrator needs to decide on (retry, rejoin, give up) is derived
/// from the reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request failed: {reason}")]
pub struct RequestError {
    /// Wire reason string, e.g. `GROUPCALL_FORBIDDEN` or `FLOOD_WAIT_3`.
    pub reason: String,
}

impl RequestError {
    /// Create an error from a wire reason string.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Whether this is a rate-limiting failure (`FLOOD_WAIT_<n>`).
    #[must_use]
    pub fn is_flood(&self) -> bool {
        self.reason.starts_with(reasons::FLOOD_WAIT_PREFIX)
    }
}

/// Categorized join failure surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// Anonymous users may not join this call.
    AnonymousForbidden,
    /// The call is at capacity.
    TooManyParticipants,
    /// The call is gone or we are not allowed in.
    NotAccessible,
    /// Anything else; the call ends up `Failed`.
    ServerError,
}

impl JoinFailure {
    /// Map a wire reason onto a failure category.
    #[must_use]
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            reasons::ANONYMOUS_FORBIDDEN => Self::AnonymousForbidden,
            reasons::PARTICIPANTS_TOO_MUCH => Self::TooManyParticipants,
            reasons::FORBIDDEN | reasons::JOIN_MISSING => Self::NotAccessible,
            _ => Self::ServerError,
        }
    }

    /// User-facing message for this category (no wire details).
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::AnonymousForbidden => "Anonymous users cannot join this call",
            Self::TooManyParticipants => "The call is full",
            Self::NotAccessible => "This call no longer exists or you were removed from it",
            Self::ServerError => "An error occurred, the call has ended",
        }
    }
}

/// Orchestrator-level error type returned by `GroupCallHandle` methods.
#[derive(Debug, Error)]
pub enum CallError {
    /// A signaling request failed.
    #[error("Signaling error: {0}")]
    Signaling(#[from] RequestError),

    /// The call actor has shut down.
    #[error("Call actor is gone")]
    ActorGone,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
