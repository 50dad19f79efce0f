//! Speaking activity tracking.
//!
//! Audio level samples arrive in batches from the media engine. The
//! tracker keeps per-source last-spoke times, decides when the roster's
//! speaking flags need a re-check and throttles the outgoing "speaking"
//! progress signal. The actor owns the check timer; the tracker only
//! reports what the timer should do.

use std::collections::HashMap;

use crate::media::LevelUpdate;

/// Level above which a sample counts as speech.
pub const SPEAK_LEVEL_THRESHOLD: f32 = 0.2;

/// Speaking flags are re-checked this often while anyone is hot.
pub const CHECK_LAST_SPOKE_INTERVAL_MS: i64 = 1_000;

/// Minimum gap between outgoing "speaking" progress signals.
pub const SPEAKING_PROGRESS_EACH_MS: i64 = 500;

/// Last time a source produced anything / voice, monotonic ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastSpokeTimes {
    pub anything: i64,
    pub voice: i64,
}

/// What a registered level batch asks of the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelsOutcome {
    /// Run the speaking re-check immediately.
    pub check_now: bool,
    /// Arm the periodic re-check if it is not already armed.
    pub schedule_check: bool,
    /// Send the throttled speaking progress signal.
    pub send_speaking_progress: bool,
}

/// Result of a periodic check pass.
#[derive(Debug, Default)]
pub struct CheckResult {
    /// Spoke-times to flush into the roster, pruned entries included so
    /// their final state is applied exactly once.
    pub flushes: Vec<(u32, LastSpokeTimes)>,
    /// Whether anything is still within the window; when false the
    /// periodic check stops itself.
    pub has_recent: bool,
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_spoke: HashMap<u32, LastSpokeTimes>,
    last_progress_at: Option<i64>,
    my_last_level: Option<(f32, bool)>,
}

impl ActivityTracker {
    /// Engines keep reporting the own zero level while muted; a batch
    /// that is exactly the previous self sample again is dropped whole.
    pub fn suppress_own_silence(&mut self, updates: &[LevelUpdate]) -> bool {
        if let [only] = updates {
            if only.ssrc == 0 {
                if self.my_last_level == Some((only.level, only.voice)) {
                    return true;
                }
                self.my_last_level = Some((only.level, only.voice));
            }
        }
        false
    }

    /// Register a level batch. `my_ssrc` resolves the zero (self)
    /// source; `now_ms` is the actor's monotonic clock.
    pub fn register(
        &mut self,
        updates: &[LevelUpdate],
        my_ssrc: u32,
        now_ms: i64,
    ) -> LevelsOutcome {
        let mut outcome = LevelsOutcome::default();
        let mut any_hot = false;

        for update in updates {
            let ssrc = if update.ssrc == 0 {
                my_ssrc
            } else {
                update.ssrc
            };
            if update.level <= SPEAK_LEVEL_THRESHOLD {
                continue;
            }
            let me = my_ssrc != 0 && ssrc == my_ssrc;
            if me && update.voice {
                let due = self
                    .last_progress_at
                    .map_or(true, |at| at + SPEAKING_PROGRESS_EACH_MS < now_ms);
                if due {
                    self.last_progress_at = Some(now_ms);
                    outcome.send_speaking_progress = true;
                }
            }
            if ssrc == 0 {
                continue;
            }
            any_hot = true;
            match self.last_spoke.get_mut(&ssrc) {
                None => {
                    self.last_spoke.insert(
                        ssrc,
                        LastSpokeTimes {
                            anything: now_ms,
                            voice: if update.voice {
                                now_ms
                            } else {
                                now_ms - CHECK_LAST_SPOKE_INTERVAL_MS
                            },
                        },
                    );
                    outcome.check_now = true;
                }
                Some(when) => {
                    let stale = when.anything + CHECK_LAST_SPOKE_INTERVAL_MS / 3 <= now_ms
                        || (update.voice
                            && when.voice + CHECK_LAST_SPOKE_INTERVAL_MS / 3 <= now_ms);
                    if stale {
                        outcome.check_now = true;
                    }
                    when.anything = now_ms;
                    if update.voice {
                        when.voice = now_ms;
                    }
                }
            }
        }

        outcome.schedule_check = any_hot && !outcome.check_now;
        outcome
    }

    /// Run one check pass: prune entries that fell out of the window and
    /// hand every spoke-time (kept and pruned) back for roster flushing.
    pub fn check(&mut self, now_ms: i64) -> CheckResult {
        let mut result = CheckResult {
            flushes: Vec::with_capacity(self.last_spoke.len()),
            has_recent: false,
        };
        self.last_spoke.retain(|&ssrc, when| {
            result.flushes.push((ssrc, *when));
            let keep = when.anything + CHECK_LAST_SPOKE_INTERVAL_MS >= now_ms;
            result.has_recent |= keep;
            keep
        });
        result
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_spoke.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample(ssrc: u32, level: f32, voice: bool) -> LevelUpdate {
        LevelUpdate { ssrc, level, voice }
    }

    #[test]
    fn test_quiet_samples_ignored() {
        let mut tracker = ActivityTracker::default();
        let outcome = tracker.register(&[sample(100, 0.1, true)], 1, 0);
        assert_eq!(outcome, LevelsOutcome::default());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_new_speaker_checks_immediately() {
        let mut tracker = ActivityTracker::default();
        let outcome = tracker.register(&[sample(100, 0.5, true)], 1, 0);
        assert!(outcome.check_now);
        assert!(!outcome.schedule_check);
    }

    #[test]
    fn test_fresh_repeat_schedules_instead_of_checking() {
        let mut tracker = ActivityTracker::default();
        tracker.register(&[sample(100, 0.5, true)], 1, 0);

        let outcome = tracker.register(&[sample(100, 0.5, true)], 1, 100);
        assert!(!outcome.check_now);
        assert!(outcome.schedule_check);

        // A third of the interval later the entry is stale again.
        let outcome = tracker.register(&[sample(100, 0.5, true)], 1, 100 + 334);
        assert!(outcome.check_now);
    }

    #[test]
    fn test_check_prunes_and_flushes_once() {
        let mut tracker = ActivityTracker::default();
        tracker.register(&[sample(100, 0.5, true), sample(200, 0.5, false)], 1, 0);

        let result = tracker.check(500);
        assert_eq!(result.flushes.len(), 2);
        assert!(result.has_recent);

        // Both entries age out; they are flushed one last time and gone.
        let result = tracker.check(2_000);
        assert_eq!(result.flushes.len(), 2);
        assert!(!result.has_recent);
        assert!(tracker.is_empty());

        let result = tracker.check(3_000);
        assert!(result.flushes.is_empty());
    }

    #[test]
    fn test_speaking_progress_throttled() {
        let mut tracker = ActivityTracker::default();
        let my_ssrc = 7;

        let outcome = tracker.register(&[sample(0, 0.5, true)], my_ssrc, 0);
        assert!(outcome.send_speaking_progress);

        let outcome = tracker.register(&[sample(0, 0.5, true)], my_ssrc, 300);
        assert!(!outcome.send_speaking_progress);

        let outcome = tracker.register(&[sample(0, 0.5, true)], my_ssrc, 600);
        assert!(outcome.send_speaking_progress);
    }

    #[test]
    fn test_no_progress_without_voice_or_before_join() {
        let mut tracker = ActivityTracker::default();

        // Loud but no voice activity.
        let outcome = tracker.register(&[sample(0, 0.5, false)], 7, 0);
        assert!(!outcome.send_speaking_progress);

        // Not joined yet: the self sample cannot be attributed.
        let outcome = tracker.register(&[sample(0, 0.5, true)], 0, 0);
        assert!(!outcome.send_speaking_progress);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_own_silence_deduplicated() {
        let mut tracker = ActivityTracker::default();

        assert!(!tracker.suppress_own_silence(&[sample(0, 0.0, false)]));
        assert!(tracker.suppress_own_silence(&[sample(0, 0.0, false)]));
        assert!(tracker.suppress_own_silence(&[sample(0, 0.0, false)]));

        // A different self sample goes through again.
        assert!(!tracker.suppress_own_silence(&[sample(0, 0.3, true)]));

        // Batches with other sources are never suppressed.
        assert!(!tracker.suppress_own_silence(&[sample(0, 0.0, false), sample(5, 0.0, false)]));
    }

    #[test]
    fn test_voiceless_entry_starts_with_stale_voice_time() {
        let mut tracker = ActivityTracker::default();
        tracker.register(&[sample(100, 0.5, false)], 1, 5_000);

        let result = tracker.check(5_100);
        let (_, times) = result.flushes.first().copied().unwrap();
        assert_eq!(times.anything, 5_000);
        assert_eq!(times.voice, 5_000 - CHECK_LAST_SPOKE_INTERVAL_MS);
    }
}
