//! Incoming video stream selection.
//!
//! Tracks which sources currently deliver video, which of them the
//! embedder pinned and which one gets the full-size ("large") slot.
//! Selection only moves on its triggers: the engine-reported streaming
//! set changing, or speaking/sounding/video-mute transitions in the
//! roster. A pin overrides selection until the pinned source stops
//! streaming.

use std::collections::HashSet;

use crate::roster::{ParticipantDiff, Roster};

/// A source started or stopped delivering visible video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsVideoUpdate {
    pub ssrc: u32,
    pub streaming: bool,
}

/// What a selection pass produced.
#[derive(Debug, Default)]
pub struct StreamsOutcome {
    pub events: Vec<StreamsVideoUpdate>,
    /// The large slot moved; the engine needs the new source.
    pub large_changed: bool,
}

#[derive(Debug, Default)]
pub struct VideoStreams {
    streaming: HashSet<u32>,
    video_muted: HashSet<u32>,
    large: u32,
    pinned: u32,
}

impl VideoStreams {
    /// Current full-size source, zero for none.
    #[must_use]
    pub fn large(&self) -> u32 {
        self.large
    }

    /// Currently pinned source, zero for none.
    #[must_use]
    pub fn pinned(&self) -> u32 {
        self.pinned
    }

    /// Whether `ssrc` delivers visible (streaming, not video-muted)
    /// video right now.
    #[must_use]
    pub fn streams_video(&self, ssrc: u32) -> bool {
        ssrc != 0 && self.streaming.contains(&ssrc) && !self.video_muted.contains(&ssrc)
    }

    /// Pin a source (zero unpins). Pinning a source that does not
    /// stream is ignored. Returns whether the large slot moved.
    pub fn pin(&mut self, ssrc: u32) -> bool {
        if ssrc != 0 && !self.streams_video(ssrc) {
            return false;
        }
        self.pinned = ssrc;
        if ssrc != 0 && self.large != ssrc {
            self.large = ssrc;
            return true;
        }
        false
    }

    /// Apply the engine's full streaming set. When the large (and with
    /// it any pin) source dropped out, selection falls back.
    pub fn set_streaming(&mut self, ssrcs: &[u32], roster: &Roster) -> StreamsOutcome {
        let mut outcome = StreamsOutcome::default();
        let mut new_large = self.large;
        if new_large != 0 && !ssrcs.contains(&new_large) {
            new_large = 0;
            self.pinned = 0;
        }

        let mut removed = self.streaming.clone();
        for &ssrc in ssrcs {
            if !removed.remove(&ssrc) {
                self.streaming.insert(ssrc);
                if !self.video_muted.contains(&ssrc) {
                    outcome.events.push(StreamsVideoUpdate {
                        ssrc,
                        streaming: true,
                    });
                }
            }
        }
        for ssrc in &removed {
            self.streaming.remove(ssrc);
        }

        if new_large == 0 {
            new_large = self.choose_large(roster);
        }
        outcome.large_changed = self.set_large(new_large);

        for &ssrc in &removed {
            if !self.video_muted.contains(&ssrc) {
                outcome.events.push(StreamsVideoUpdate {
                    ssrc,
                    streaming: false,
                });
            }
        }
        outcome
    }

    /// React to one roster transition: video-mute marks and
    /// speaking/sounding promotion.
    pub fn on_participant_diff(
        &mut self,
        diff: &ParticipantDiff,
        roster: &Roster,
    ) -> StreamsOutcome {
        let mut outcome = StreamsOutcome::default();
        let mut new_large = self.large;
        let mut update_as_not_streaming = 0u32;

        let was_muted_ssrc = diff
            .was
            .as_ref()
            .filter(|p| p.video_muted)
            .map_or(0, |p| p.ssrc);
        let now_muted_ssrc = diff
            .now
            .as_ref()
            .filter(|p| p.video_muted)
            .map_or(0, |p| p.ssrc);
        if was_muted_ssrc != now_muted_ssrc {
            if was_muted_ssrc != 0
                && self.video_muted.remove(&was_muted_ssrc)
                && self.streaming.contains(&was_muted_ssrc)
                && diff.now.as_ref().map(|p| p.ssrc) == Some(was_muted_ssrc)
            {
                outcome.events.push(StreamsVideoUpdate {
                    ssrc: was_muted_ssrc,
                    streaming: true,
                });
            }
            if now_muted_ssrc != 0
                && self.video_muted.insert(now_muted_ssrc)
                && self.streaming.contains(&now_muted_ssrc)
            {
                update_as_not_streaming = now_muted_ssrc;
                if new_large == now_muted_ssrc {
                    new_large = 0;
                }
            }
        }

        new_large = self.promote_by_activity(diff, roster, new_large);

        if new_large == 0 {
            new_large = self.choose_large(roster);
        }
        outcome.large_changed = self.set_large(new_large);

        if update_as_not_streaming != 0 {
            outcome.events.push(StreamsVideoUpdate {
                ssrc: update_as_not_streaming,
                streaming: false,
            });
        }
        outcome
    }

    /// Speaking > sounding > any visible source; ties go to whoever
    /// comes first in the roster.
    #[must_use]
    pub fn choose_large(&self, roster: &Roster) -> u32 {
        let mut speaking = 0u32;
        let mut sounding = 0u32;
        let mut any = 0u32;
        for participant in roster.participants() {
            let ssrc = participant.ssrc;
            if !self.streams_video(ssrc) {
                continue;
            }
            if speaking == 0 && participant.speaking {
                speaking = ssrc;
            }
            if sounding == 0 && participant.sounding {
                sounding = ssrc;
            }
            if any == 0 {
                any = ssrc;
            }
        }
        if speaking != 0 {
            speaking
        } else if sounding != 0 {
            sounding
        } else {
            any
        }
    }

    fn set_large(&mut self, ssrc: u32) -> bool {
        if self.large == ssrc {
            return false;
        }
        self.large = ssrc;
        true
    }

    /// Move the large slot toward activity, unless a pin holds it.
    fn promote_by_activity(
        &self,
        diff: &ParticipantDiff,
        roster: &Roster,
        current: u32,
    ) -> u32 {
        let was_speaking = diff.was.as_ref().is_some_and(|p| p.speaking);
        let was_sounding = diff.was.as_ref().is_some_and(|p| p.sounding);
        let now_speaking = diff.now.as_ref().is_some_and(|p| p.speaking);
        let now_sounding = diff.now.as_ref().is_some_and(|p| p.sounding);
        if now_speaking == was_speaking && now_sounding == was_sounding {
            return current;
        }
        if self.pinned != 0 {
            return current;
        }

        let was_ssrc = diff.was.as_ref().map_or(0, |p| p.ssrc);
        let now_ssrc = diff.now.as_ref().map_or(0, |p| p.ssrc);
        if (was_speaking || was_sounding) && was_ssrc == current {
            // The large speaker went quiet; hand the slot to the best
            // audible source that shows video, if any.
            let mut speaking = 0u32;
            let mut sounding = 0u32;
            for participant in roster.participants() {
                let ssrc = participant.ssrc;
                if !self.streams_video(ssrc) {
                    continue;
                }
                if participant.speaking {
                    speaking = ssrc;
                    break;
                }
                if sounding == 0 && participant.sounding {
                    sounding = ssrc;
                }
            }
            let best = if speaking != 0 { speaking } else { sounding };
            if best != 0 {
                return best;
            }
        } else if (now_speaking || now_sounding)
            && now_ssrc != current
            && self.streams_video(now_ssrc)
        {
            let holder = roster.by_ssrc(current);
            let holder_speaking = holder.is_some_and(|p| p.speaking);
            let holder_sounding = holder.is_some_and(|p| p.sounding);
            if (now_speaking && !holder_speaking) || (now_sounding && !holder_sounding) {
                return now_ssrc;
            }
        }
        current
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::{ParticipantUpdate, PeerId};

    fn join(roster: &mut Roster, peer: i64, ssrc: u32) {
        roster.apply(&ParticipantUpdate {
            peer: PeerId(peer),
            ssrc,
            can_self_unmute: true,
            ..Default::default()
        });
    }

    fn mark_speaking(roster: &mut Roster, ssrc: u32) -> ParticipantDiff {
        roster
            .apply_last_spoke(
                ssrc,
                crate::activity::LastSpokeTimes {
                    anything: 1,
                    voice: 1,
                },
                2,
            )
            .unwrap()
    }

    #[test]
    fn test_streaming_set_fires_updates() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        let mut streams = VideoStreams::default();

        let outcome = streams.set_streaming(&[100, 200], &roster);
        assert_eq!(outcome.events.len(), 2);
        assert!(outcome.events.iter().all(|e| e.streaming));
        assert!(outcome.large_changed);
        // First in roster wins the tie.
        assert_eq!(streams.large(), 100);

        let outcome = streams.set_streaming(&[200], &roster);
        assert!(outcome
            .events
            .contains(&StreamsVideoUpdate {
                ssrc: 100,
                streaming: false
            }));
        assert_eq!(streams.large(), 200);
        assert!(!streams.streams_video(100));
    }

    #[test]
    fn test_choose_prefers_speaking_over_sounding() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        join(&mut roster, 3, 300);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100, 200, 300], &roster);

        // 200 sounds, 300 speaks.
        roster
            .apply_last_spoke(
                200,
                crate::activity::LastSpokeTimes {
                    anything: 1,
                    voice: 0,
                },
                2,
            )
            .unwrap();
        mark_speaking(&mut roster, 300);

        assert_eq!(streams.choose_large(&roster), 300);
    }

    #[test]
    fn test_pin_overrides_until_stream_stops() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100, 200], &roster);

        assert!(streams.pin(200));
        assert_eq!(streams.large(), 200);
        assert_eq!(streams.pinned(), 200);

        // Speaking transitions do not move a pinned large slot.
        let diff = mark_speaking(&mut roster, 100);
        let outcome = streams.on_participant_diff(&diff, &roster);
        assert!(!outcome.large_changed);
        assert_eq!(streams.large(), 200);

        // The pinned source stops streaming: pin cleared, fallback.
        let outcome = streams.set_streaming(&[100], &roster);
        assert!(outcome.large_changed);
        assert_eq!(streams.pinned(), 0);
        assert_eq!(streams.large(), 100);
    }

    #[test]
    fn test_pinning_non_streaming_source_ignored() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100], &roster);

        assert!(!streams.pin(999));
        assert_eq!(streams.pinned(), 0);
        assert_eq!(streams.large(), 100);
    }

    #[test]
    fn test_speaker_takes_large_slot() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100, 200], &roster);
        assert_eq!(streams.large(), 100);

        let diff = mark_speaking(&mut roster, 200);
        let outcome = streams.on_participant_diff(&diff, &roster);
        assert!(outcome.large_changed);
        assert_eq!(streams.large(), 200);
    }

    #[test]
    fn test_video_mute_moves_large_and_fires_events() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100, 200], &roster);
        assert_eq!(streams.large(), 100);

        // 100 mutes its video: reported as not streaming, large moves.
        let diff = roster.apply(&ParticipantUpdate {
            peer: PeerId(1),
            ssrc: 100,
            can_self_unmute: true,
            video_muted: true,
            ..Default::default()
        });
        let outcome = streams.on_participant_diff(&diff, &roster);
        assert!(outcome.large_changed);
        assert_eq!(streams.large(), 200);
        assert!(outcome.events.contains(&StreamsVideoUpdate {
            ssrc: 100,
            streaming: false
        }));
        assert!(!streams.streams_video(100));

        // And back.
        let diff = roster.apply(&ParticipantUpdate {
            peer: PeerId(1),
            ssrc: 100,
            can_self_unmute: true,
            video_muted: false,
            ..Default::default()
        });
        let outcome = streams.on_participant_diff(&diff, &roster);
        assert!(outcome.events.contains(&StreamsVideoUpdate {
            ssrc: 100,
            streaming: true
        }));
        assert!(streams.streams_video(100));
    }

    #[test]
    fn test_quiet_large_passes_slot_to_audible_video() {
        let mut roster = Roster::default();
        join(&mut roster, 1, 100);
        join(&mut roster, 2, 200);
        let mut streams = VideoStreams::default();
        streams.set_streaming(&[100, 200], &roster);

        let diff = mark_speaking(&mut roster, 100);
        streams.on_participant_diff(&diff, &roster);
        let diff = mark_speaking(&mut roster, 200);
        streams.on_participant_diff(&diff, &roster);
        assert_eq!(streams.large(), 100);

        // 100 goes quiet while 200 still speaks.
        let diff = roster
            .apply_last_spoke(
                100,
                crate::activity::LastSpokeTimes {
                    anything: 1,
                    voice: 1,
                },
                5_000,
            )
            .unwrap();
        let outcome = streams.on_participant_diff(&diff, &roster);
        assert!(outcome.large_changed);
        assert_eq!(streams.large(), 200);
    }
}
