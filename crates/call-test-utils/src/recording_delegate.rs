//! Delegate implementation that records every callback.

use std::sync::{Mutex, MutexGuard, PoisonError};

use call_orchestrator::call::{CallDelegate, CallSound, OtherParticipantState};
use call_orchestrator::errors::JoinFailure;
use call_orchestrator::media::LevelUpdate;

/// One recorded delegate callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateEvent {
    Sound(CallSound),
    Finished,
    Failed,
    JoinFailed(JoinFailure),
    AllowedToSpeak,
    StreamsVideoUpdated { ssrc: u32, streaming: bool },
    OtherParticipantState(OtherParticipantState),
    Level(LevelUpdate),
}

/// Recording [`CallDelegate`] implementation.
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<DelegateEvent>>,
}

impl RecordingDelegate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DelegateEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything reported so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<DelegateEvent> {
        self.lock().clone()
    }

    /// Sounds played, in order.
    #[must_use]
    pub fn sounds(&self) -> Vec<CallSound> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::Sound(sound) => Some(*sound),
                _ => None,
            })
            .collect()
    }

    /// Join failures reported, in order.
    #[must_use]
    pub fn join_failures(&self) -> Vec<JoinFailure> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::JoinFailed(failure) => Some(*failure),
                _ => None,
            })
            .collect()
    }

    /// Video streaming notifications, in order.
    #[must_use]
    pub fn video_updates(&self) -> Vec<(u32, bool)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::StreamsVideoUpdated { ssrc, streaming } => {
                    Some((*ssrc, *streaming))
                }
                _ => None,
            })
            .collect()
    }

    /// Other-participant volume/mute notifications, in order.
    #[must_use]
    pub fn other_participant_states(&self) -> Vec<OtherParticipantState> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::OtherParticipantState(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Level samples forwarded, in order.
    #[must_use]
    pub fn levels(&self) -> Vec<LevelUpdate> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                DelegateEvent::Level(update) => Some(*update),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn finished_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::Finished))
            .count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::Failed))
            .count()
    }

    #[must_use]
    pub fn allowed_to_speak_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::AllowedToSpeak))
            .count()
    }
}

impl CallDelegate for RecordingDelegate {
    fn play_sound(&self, sound: CallSound) {
        self.lock().push(DelegateEvent::Sound(sound));
    }

    fn call_finished(&self) {
        self.lock().push(DelegateEvent::Finished);
    }

    fn call_failed(&self) {
        self.lock().push(DelegateEvent::Failed);
    }

    fn join_failed(&self, failure: JoinFailure) {
        self.lock().push(DelegateEvent::JoinFailed(failure));
    }

    fn allowed_to_speak(&self) {
        self.lock().push(DelegateEvent::AllowedToSpeak);
    }

    fn streams_video_updated(&self, ssrc: u32, streaming: bool) {
        self.lock()
            .push(DelegateEvent::StreamsVideoUpdated { ssrc, streaming });
    }

    fn other_participant_state(&self, state: OtherParticipantState) {
        self.lock().push(DelegateEvent::OtherParticipantState(state));
    }

    fn level_updated(&self, update: LevelUpdate) {
        self.lock().push(DelegateEvent::Level(update));
    }
}
