//! Call configuration.
//!
//! All external knobs are injected here by the embedder when the call is
//! spawned and updated through `GroupCallHandle` methods afterwards; the
//! orchestrator never reads ambient process-wide settings.

use std::collections::HashSet;
use std::time::Duration;

use crate::signaling::PeerId;

/// Default push-to-talk release delay.
pub const DEFAULT_PUSH_TO_TALK_DELAY: Duration = Duration::from_millis(20);

/// Media device selection and push-to-talk settings.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Audio capture device id handed to the media engine.
    pub audio_input_id: String,
    /// Audio playback device id handed to the media engine.
    pub audio_output_id: String,
    /// Video capture device id handed to the media engine.
    pub video_input_id: String,
    /// How long the microphone stays open after the key is released.
    pub push_to_talk_delay: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            audio_input_id: String::new(),
            audio_output_id: String::new(),
            video_input_id: String::new(),
            push_to_talk_delay: DEFAULT_PUSH_TO_TALK_DELAY,
        }
    }
}

/// What the local identity is allowed to do in this call.
///
/// The embedder resolves chat-level rights before spawning the call and
/// hands them over here.
#[derive(Debug, Clone, Default)]
pub struct CallPermissions {
    /// Whether we can mute and unmute other participants for everyone.
    pub can_manage: bool,
    /// Peers that keep the right to unmute themselves even when muted by
    /// an admin.
    pub admins: HashSet<PeerId>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.push_to_talk_delay, DEFAULT_PUSH_TO_TALK_DELAY);
        assert!(config.audio_input_id.is_empty());
    }

    #[test]
    fn test_default_permissions() {
        let permissions = CallPermissions::default();
        assert!(!permissions.can_manage);
        assert!(permissions.admins.is_empty());
    }
}
