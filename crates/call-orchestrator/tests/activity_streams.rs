//! Activity tracking, stream selection and volume propagation tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use call_orchestrator::media::LevelUpdate;
use call_orchestrator::roster::Participant;
use call_orchestrator::signaling::PeerId;
use call_test_utils::{
    participant, settle, video_participant, TestCall, FIRST_ENGINE_SSRC,
};

fn level(ssrc: u32, level: f32, voice: bool) -> LevelUpdate {
    LevelUpdate { ssrc, level, voice }
}

async fn find(call: &TestCall, peer: i64) -> Participant {
    call.handle
        .participants()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.peer == PeerId(peer))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_levels_forwarded_with_self_resolved() {
    let call = TestCall::spawn_joined().await;

    call.engine()
        .report_audio_levels(vec![level(0, 0.5, true), level(200, 0.3, false)]);
    settle().await;

    let levels = call.delegate.levels();
    assert_eq!(levels.len(), 2);
    assert_eq!(levels.first().unwrap().ssrc, FIRST_ENGINE_SSRC);
    assert_eq!(levels.get(1).unwrap().ssrc, 200);
}

#[tokio::test(start_paused = true)]
async fn test_speaking_progress_throttled() {
    let call = TestCall::spawn_joined().await;

    call.engine().report_audio_levels(vec![level(0, 0.5, true)]);
    settle().await;
    assert_eq!(call.signaling.speaking_progress_count(), 1);

    // Within the throttle window: no second signal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    call.engine().report_audio_levels(vec![level(0, 0.6, true)]);
    settle().await;
    assert_eq!(call.signaling.speaking_progress_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    call.engine().report_audio_levels(vec![level(0, 0.7, true)]);
    settle().await;
    assert_eq!(call.signaling.speaking_progress_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_own_repeated_level_suppressed() {
    let call = TestCall::spawn_joined().await;

    call.engine().report_audio_levels(vec![level(0, 0.0, false)]);
    call.engine().report_audio_levels(vec![level(0, 0.0, false)]);
    call.engine().report_audio_levels(vec![level(0, 0.0, false)]);
    settle().await;

    assert_eq!(call.delegate.levels().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_speaking_flags_set_and_pruned() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.engine().report_audio_levels(vec![level(200, 0.5, true)]);
    settle().await;

    let p = find(&call, 2).await;
    assert!(p.speaking);
    assert!(p.sounding);

    // The source goes quiet; the periodic check prunes it.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let p = find(&call, 2).await;
    assert!(!p.speaking);
    assert!(!p.sounding);
}

#[tokio::test(start_paused = true)]
async fn test_quiet_levels_never_mark_speaking() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.engine().report_audio_levels(vec![level(200, 0.1, true)]);
    settle().await;

    assert!(!find(&call, 2).await.speaking);
}

#[tokio::test(start_paused = true)]
async fn test_video_selection_follows_activity_and_pin() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200), participant(3, 300)])
        .await;

    call.engine().report_video_sources(vec![200]);
    settle().await;
    assert!(call.delegate.video_updates().contains(&(200, true)));
    assert_eq!(call.handle.large_video(), 200);
    assert_eq!(call.engine().full_size_sources().last(), Some(&200));

    // A second source appears; the large slot does not move.
    call.engine().report_video_sources(vec![200, 300]);
    settle().await;
    assert!(call.delegate.video_updates().contains(&(300, true)));
    assert_eq!(call.handle.large_video(), 200);

    // The other source speaks and takes the slot.
    call.engine().report_audio_levels(vec![level(300, 0.5, true)]);
    settle().await;
    assert_eq!(call.handle.large_video(), 300);

    // A pin overrides activity.
    call.handle.pin_video_stream(200).await.unwrap();
    settle().await;
    assert_eq!(call.handle.large_video(), 200);

    // The pinned source stops streaming: pin drops, selection falls
    // back to the speaker.
    call.engine().report_video_sources(vec![300]);
    settle().await;
    assert!(call.delegate.video_updates().contains(&(200, false)));
    assert_eq!(call.handle.large_video(), 300);
}

#[tokio::test(start_paused = true)]
async fn test_pinning_non_streaming_source_ignored() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;
    call.engine().report_video_sources(vec![200]);
    settle().await;

    call.handle.pin_video_stream(999).await.unwrap();
    settle().await;

    assert_eq!(call.handle.large_video(), 200);
}

#[tokio::test(start_paused = true)]
async fn test_change_volume_propagates() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.handle
        .change_volume(PeerId(2), 5_000, false)
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.engine().volumes_for(200), vec![0.5]);
    let state = *call.delegate.other_participant_states().last().unwrap();
    assert_eq!(state.peer, PeerId(2));
    assert_eq!(state.volume, 5_000);
    assert!(!state.muted_by_me);
    let edits = call.signaling.participant_edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits.first().unwrap().volume, Some(5_000));

    // Locally-only changes skip the server round-trip.
    call.handle
        .change_volume(PeerId(2), 2_000, true)
        .await
        .unwrap();
    settle().await;
    assert_eq!(call.engine().volumes_for(200), vec![0.5, 0.2]);
    assert_eq!(call.signaling.participant_edits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_volume_clamped_to_valid_range() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.handle
        .change_volume(PeerId(2), 50_000, true)
        .await
        .unwrap();
    settle().await;

    assert_eq!(find(&call, 2).await.volume, 20_000);
    assert_eq!(call.engine().volumes_for(200), vec![2.0]);
}

#[tokio::test(start_paused = true)]
async fn test_local_mute_zeroes_playback() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.handle
        .toggle_mute_participant(PeerId(2), true, true)
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.engine().volumes_for(200), vec![0.0]);
    let p = find(&call, 2).await;
    assert!(p.muted_by_me);
    // A local playback mute is not an authoritative server mute.
    assert!(!p.muted);
    assert!(call.signaling.participant_edits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_admin_mute_is_authoritative() {
    let call = TestCall::builder().can_manage().spawn().await;
    call.push_updates(vec![participant(2, 200)]).await;

    call.handle
        .toggle_mute_participant(PeerId(2), true, false)
        .await
        .unwrap();
    settle().await;

    let p = find(&call, 2).await;
    assert!(p.muted);
    assert!(!p.can_self_unmute);
    assert!(!p.muted_by_me);
    let edits = call.signaling.participant_edits();
    assert_eq!(edits.len(), 1);
    assert!(edits.first().unwrap().muted);
}

#[tokio::test(start_paused = true)]
async fn test_roster_exposes_video_params() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![video_participant(4, 400, vec![40, 41])])
        .await;

    let p = find(&call, 4).await;
    let params = p.video_params.unwrap();
    assert!(params.contains_source(40));
    assert!(params.contains_source(41));
}
