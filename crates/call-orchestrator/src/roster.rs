//! Participant roster.
//!
//! Pure data: the server's participant list as last seen, updated by
//! delta application. Every mutation returns a was/now snapshot so the
//! actor can recompute stream selection and fire observables from the
//! transition, not from the end state.

use crate::activity::LastSpokeTimes;
use crate::payload::VideoParams;
use crate::signaling::{ParticipantUpdate, PeerId};

/// Default playback volume (nominal gain).
pub const DEFAULT_VOLUME: i32 = 10_000;

/// Maximum playback volume (double gain).
pub const MAX_VOLUME: i32 = 20_000;

/// How long a spoke-time keeps a participant speaking/sounding, ms.
pub const LAST_SPOKE_WINDOW_MS: i64 = 1_000;

/// One participant as currently known.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub peer: PeerId,
    /// Audio source id; zero means not addressable by media.
    pub ssrc: u32,
    pub video_params: Option<VideoParams>,
    pub muted: bool,
    /// Muted locally by us, affecting only our playback.
    pub muted_by_me: bool,
    pub can_self_unmute: bool,
    /// Voice detected within the last-spoke window.
    pub speaking: bool,
    /// Any audio detected within the last-spoke window.
    pub sounding: bool,
    pub video_muted: bool,
    /// Playback volume in 0..=20000.
    pub volume: i32,
    pub joined_date: i64,
    pub last_active: i64,
    /// Raised-hand ordering rating; zero when the hand is down.
    pub raise_hand_rating: u64,
}

/// Was/now snapshot of one roster transition.
#[derive(Debug, Clone, Default)]
pub struct ParticipantDiff {
    pub was: Option<Participant>,
    pub now: Option<Participant>,
}

/// The participant list, in server insertion order.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    /// All participants, insertion-ordered.
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    #[must_use]
    pub fn get(&self, peer: PeerId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.peer == peer)
    }

    /// Look up by audio source. Entries without an ssrc are never
    /// addressable this way.
    #[must_use]
    pub fn by_ssrc(&self, ssrc: u32) -> Option<&Participant> {
        if ssrc == 0 {
            return None;
        }
        self.participants.iter().find(|p| p.ssrc == ssrc)
    }

    /// Highest raised-hand rating currently in the roster.
    #[must_use]
    pub fn max_raise_hand_rating(&self) -> u64 {
        self.participants
            .iter()
            .map(|p| p.raise_hand_rating)
            .max()
            .unwrap_or(0)
    }

    /// Apply one delta. `left` removes; otherwise the entry is inserted
    /// or updated in place. Minimal updates refresh presence but keep
    /// the previously known volume and muted-by-me flag.
    pub fn apply(&mut self, update: &ParticipantUpdate) -> ParticipantDiff {
        if update.left {
            let was = self
                .participants
                .iter()
                .position(|p| p.peer == update.peer)
                .map(|index| self.participants.remove(index));
            return ParticipantDiff { was, now: None };
        }

        let previous = self
            .participants
            .iter()
            .position(|p| p.peer == update.peer);
        let was = previous.and_then(|index| self.participants.get(index).cloned());

        let (kept_volume, kept_muted_by_me) = was
            .as_ref()
            .map(|p| (p.volume, p.muted_by_me))
            .unwrap_or((DEFAULT_VOLUME, false));
        let ssrc_changed = was.as_ref().map(|p| p.ssrc) != Some(update.ssrc);
        let (speaking, sounding) = if update.muted || ssrc_changed {
            (false, false)
        } else {
            was.as_ref()
                .map(|p| (p.speaking, p.sounding))
                .unwrap_or((false, false))
        };

        let now = Participant {
            peer: update.peer,
            ssrc: update.ssrc,
            video_params: update.video_params.clone(),
            muted: update.muted,
            muted_by_me: if update.minimal {
                kept_muted_by_me
            } else {
                update.muted_by_you
            },
            can_self_unmute: update.can_self_unmute,
            speaking,
            sounding,
            video_muted: update.video_muted,
            volume: if update.minimal {
                kept_volume
            } else {
                update.volume.unwrap_or(kept_volume)
            },
            joined_date: update.joined_date,
            last_active: update.last_active,
            raise_hand_rating: update.raise_hand_rating.unwrap_or(0),
        };

        match previous {
            Some(index) => {
                if let Some(slot) = self.participants.get_mut(index) {
                    *slot = now.clone();
                }
            }
            None => self.participants.push(now.clone()),
        }

        // Live ssrcs are unique; an entry resurfacing under a new peer
        // supersedes whoever held the ssrc before.
        if update.ssrc != 0 {
            self.participants
                .retain(|p| p.peer == update.peer || p.ssrc != update.ssrc);
        }

        ParticipantDiff {
            was,
            now: Some(now),
        }
    }

    /// Refresh speaking/sounding flags of one source from its spoke
    /// times. Returns the diff only when something changed.
    pub fn apply_last_spoke(
        &mut self,
        ssrc: u32,
        times: LastSpokeTimes,
        now_ms: i64,
    ) -> Option<ParticipantDiff> {
        if ssrc == 0 {
            return None;
        }
        let participant = self.participants.iter_mut().find(|p| p.ssrc == ssrc)?;
        let within = |at: i64| at > 0 && now_ms - at < LAST_SPOKE_WINDOW_MS;
        let sounding = within(times.anything);
        let speaking = within(times.voice) && !participant.muted;
        if participant.sounding == sounding && participant.speaking == speaking {
            return None;
        }
        let was = participant.clone();
        participant.sounding = sounding;
        participant.speaking = speaking;
        Some(ParticipantDiff {
            now: Some(participant.clone()),
            was: Some(was),
        })
    }
}
