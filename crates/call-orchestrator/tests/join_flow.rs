//! Join protocol, rejoin and state machine integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use call_orchestrator::call::{CallSound, MuteState, State};
use call_orchestrator::errors::{reasons, JoinFailure};
use call_orchestrator::signaling::{CallUpdate, PeerId, SelfEditKind};
use call_test_utils::{
    left, participant, self_update, settle, MockSignaling, Recorded, TestCall,
    FIRST_ENGINE_SSRC, SELF_PEER, TEST_CALL_ID,
};

fn recording_toggles(call: &TestCall) -> usize {
    call.signaling
        .requests()
        .iter()
        .filter(|r| matches!(r, Recorded::ToggleRecording { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_join_reaches_connecting_then_joined() {
    let call = TestCall::spawn().await;

    assert_eq!(call.handle.state(), State::Connecting);
    assert_eq!(call.signaling.join_requests().len(), 1);
    let ssrc = call.handle.my_ssrc().await.unwrap();
    assert_eq!(ssrc, FIRST_ENGINE_SSRC);

    call.engine().report_connected(true);
    settle().await;

    assert_eq!(call.handle.state(), State::Joined);
    assert!(call.delegate.sounds().contains(&CallSound::Started));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_ssrc_retries_once_with_new_payload() {
    let signaling = Arc::new(MockSignaling::new());
    signaling.push_join_err(reasons::SSRC_DUPLICATE_MUCH);

    let call = TestCall::builder().signaling(signaling).spawn().await;

    let joins = call.signaling.join_requests();
    assert_eq!(joins.len(), 2);
    // The retry carries a fresh payload.
    let first = joins.first().unwrap();
    let second = joins.get(1).unwrap();
    assert_ne!(first.payload_json, second.payload_json);
    assert_eq!(call.handle.state(), State::Connecting);
    assert!(call.delegate.join_failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_create_fails_categorized() {
    let signaling = Arc::new(MockSignaling::new());
    signaling.push_create_err(reasons::ANONYMOUS_FORBIDDEN);

    let call = TestCall::builder()
        .creating()
        .signaling(signaling)
        .spawn()
        .await;

    assert_eq!(
        call.delegate.join_failures(),
        vec![JoinFailure::AnonymousForbidden]
    );
    assert_eq!(call.handle.state(), State::Failed);
    assert_eq!(call.delegate.failed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_failure_ends_with_category() {
    let signaling = Arc::new(MockSignaling::new());
    signaling.push_join_err(reasons::PARTICIPANTS_TOO_MUCH);

    let call = TestCall::builder().signaling(signaling).spawn().await;

    assert_eq!(
        call.delegate.join_failures(),
        vec![JoinFailure::TooManyParticipants]
    );
    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.delegate.finished_count(), 1);
    // Never confirmed server-side, so nothing to leave.
    assert_eq!(call.signaling.leave_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_kicked_self_rejoins() {
    let call = TestCall::spawn_joined().await;

    let mut kicked = self_update(FIRST_ENGINE_SSRC);
    kicked.left = true;
    call.push_updates(vec![kicked]).await;

    assert_eq!(call.signaling.join_requests().len(), 2);
    assert_eq!(call.handle.state(), State::Joined);
    // The engine survives the rejoin.
    assert_eq!(call.engines.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_joined_elsewhere_hangs_up() {
    let call = TestCall::spawn_joined().await;

    let mut elsewhere = self_update(9_999);
    elsewhere.muted = true;
    call.push_updates(vec![elsewhere]).await;

    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.signaling.leave_count(), 1);
    assert!(call.delegate.sounds().contains(&CallSound::Ended));
    assert_eq!(call.delegate.finished_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_self_updates_queued_until_joined() {
    let signaling = Arc::new(MockSignaling::new());
    signaling.set_join_delay(Duration::from_secs(5));

    let call = TestCall::builder().signaling(signaling).spawn().await;
    assert_eq!(call.handle.state(), State::Joining);

    // Force-muted by an admin while the join is still in flight.
    let mut forced = self_update(FIRST_ENGINE_SSRC);
    forced.muted = true;
    forced.can_self_unmute = false;
    call.push_updates(vec![forced]).await;
    assert_ne!(call.handle.muted(), MuteState::ForceMuted);

    tokio::time::sleep(Duration::from_millis(5_100)).await;

    assert_eq!(call.handle.state(), State::Connecting);
    assert_eq!(call.handle.muted(), MuteState::ForceMuted);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_rechecks_while_connecting() {
    let call = TestCall::spawn().await;
    assert_eq!(call.handle.state(), State::Connecting);

    tokio::time::sleep(Duration::from_millis(4_100)).await;
    assert_eq!(call.signaling.check_count(), 1);

    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(call.signaling.check_count(), 2);
    assert_eq!(call.signaling.join_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_rejoins_when_server_dropped_us() {
    let call = TestCall::spawn().await;
    call.signaling.push_check_ok(vec![]);

    tokio::time::sleep(Duration::from_millis(4_100)).await;

    assert_eq!(call.signaling.check_count(), 1);
    assert_eq!(call.signaling.join_requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_waits_until_live() {
    let call = TestCall::builder().scheduled().spawn().await;

    assert_eq!(call.handle.state(), State::Waiting);
    assert!(call.signaling.join_requests().is_empty());

    call.handle
        .handle_call_update(CallUpdate::Changed {
            id: TEST_CALL_ID,
            schedule_date: None,
            record_start_date: None,
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.handle.state(), State::Connecting);
    assert_eq!(call.signaling.join_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_leaves_and_ends() {
    let call = TestCall::spawn_joined().await;

    call.handle.hangup().await.unwrap();
    settle().await;

    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.signaling.leave_count(), 1);
    assert!(call.delegate.sounds().contains(&CallSound::Ended));
    assert_eq!(call.delegate.finished_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_discarded_server_side_hangs_up() {
    let call = TestCall::spawn_joined().await;

    call.handle
        .handle_call_update(CallUpdate::Discarded { id: TEST_CALL_ID })
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.signaling.leave_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mute_transitions_send_expected_edits() {
    let call = TestCall::spawn_joined().await;
    assert_eq!(call.handle.muted(), MuteState::Active);

    call.handle.set_muted(MuteState::Muted).await.unwrap();
    settle().await;

    let mute_edits: Vec<_> = call
        .signaling
        .self_edits()
        .into_iter()
        .filter(|edit| edit.kind == SelfEditKind::Mute)
        .collect();
    assert_eq!(mute_edits.len(), 1);
    assert!(mute_edits.first().unwrap().muted);
    assert_eq!(call.engine().last_muted(), Some(true));

    // Push-to-talk unmutes the engine without server traffic.
    call.handle.push_to_talk(true).await.unwrap();
    settle().await;
    assert_eq!(call.handle.muted(), MuteState::PushToTalk);
    assert_eq!(call.engine().last_muted(), Some(false));
    let mute_edits = call
        .signaling
        .self_edits()
        .into_iter()
        .filter(|edit| edit.kind == SelfEditKind::Mute)
        .count();
    assert_eq!(mute_edits, 1);

    call.handle.push_to_talk(false).await.unwrap();
    settle().await;
    assert_eq!(call.handle.muted(), MuteState::Muted);
    assert_eq!(call.engine().last_muted(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_force_mute_and_allowed_to_speak() {
    let call = TestCall::spawn_joined().await;

    let mut forced = self_update(FIRST_ENGINE_SSRC);
    forced.muted = true;
    forced.can_self_unmute = false;
    call.push_updates(vec![forced]).await;
    assert_eq!(call.handle.muted(), MuteState::ForceMuted);
    assert_eq!(call.engine().last_muted(), Some(true));

    // Raising the hand is propagated as a raise-hand edit.
    call.handle
        .set_muted_and_update(MuteState::RaisedHand)
        .await
        .unwrap();
    settle().await;
    let raises: Vec<_> = call
        .signaling
        .self_edits()
        .into_iter()
        .filter(|edit| edit.kind == SelfEditKind::RaiseHand)
        .collect();
    assert_eq!(raises.len(), 1);
    assert!(raises.first().unwrap().raise_hand);

    // The admin allows us to speak.
    let mut allowed = self_update(FIRST_ENGINE_SSRC);
    allowed.muted = true;
    allowed.can_self_unmute = true;
    call.push_updates(vec![allowed]).await;

    assert_eq!(call.handle.muted(), MuteState::Muted);
    assert_eq!(call.delegate.allowed_to_speak_count(), 1);
    assert!(call.delegate.sounds().contains(&CallSound::AllowedToSpeak));
}

#[tokio::test(start_paused = true)]
async fn test_roster_tracks_other_participants() {
    let call = TestCall::spawn_joined().await;

    call.push_updates(vec![participant(2, 200), participant(3, 300)])
        .await;
    let peers: Vec<_> = call
        .handle
        .participants()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.peer.0)
        .collect();
    assert_eq!(peers, vec![SELF_PEER.0, 2, 3]);

    call.push_updates(vec![left(2, 200)]).await;
    let participants = call.handle.participants().await.unwrap();
    assert_eq!(participants.len(), 2);
    // The engine drops decoding state for the departed source.
    assert!(call
        .engine()
        .commands()
        .iter()
        .any(|c| matches!(c, call_test_utils::EngineCommand::RemoveSources(s) if s == &vec![200])));
}

#[tokio::test(start_paused = true)]
async fn test_updates_for_other_calls_ignored() {
    let call = TestCall::spawn_joined().await;

    call.handle
        .handle_participant_updates(TEST_CALL_ID + 1, vec![participant(2, 200)])
        .await
        .unwrap();
    settle().await;

    assert_eq!(call.handle.participants().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invite_slices_and_skips_present() {
    let call = TestCall::spawn_joined().await;
    call.push_updates(vec![participant(2, 200)]).await;

    let users: Vec<_> = (2_i64..25).map(PeerId).collect();
    call.handle.invite(users).await.unwrap();
    settle().await;

    let invites: Vec<_> = call
        .signaling
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            call_test_utils::Recorded::Invite { users, .. } => Some(users),
            _ => None,
        })
        .collect();
    // Peer 2 is already in the call; 22 remain, in slices of 10.
    let total: usize = invites.iter().map(Vec::len).sum();
    assert_eq!(total, 22);
    assert!(invites.iter().all(|slice| slice.len() <= 10));
}

#[tokio::test(start_paused = true)]
async fn test_flood_wait_join_error_is_flood() {
    let error = call_orchestrator::errors::RequestError::new("FLOOD_WAIT_17");
    assert!(error.is_flood());
}

#[tokio::test(start_paused = true)]
async fn test_self_edit_forbidden_rejoins() {
    let signaling = Arc::new(MockSignaling::new());
    // First edit after joining is the video flag sync.
    signaling.push_self_edit_err(reasons::FORBIDDEN);
    let call = TestCall::builder().signaling(signaling).spawn().await;

    assert_eq!(call.signaling.join_requests().len(), 2);
    assert_eq!(call.handle.state(), State::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_push_to_talk_release_is_delayed() {
    let call = TestCall::builder()
        .push_to_talk_delay(Duration::from_millis(300))
        .spawn()
        .await;
    call.handle.set_muted(MuteState::Muted).await.unwrap();
    settle().await;

    call.handle.push_to_talk(true).await.unwrap();
    settle().await;
    assert_eq!(call.handle.muted(), MuteState::PushToTalk);

    // The microphone stays open for the configured delay.
    call.handle.push_to_talk(false).await.unwrap();
    settle().await;
    assert_eq!(call.handle.muted(), MuteState::PushToTalk);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(call.handle.muted(), MuteState::Muted);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_while_joining_is_superseded_not_duplicated() {
    let call = TestCall::spawn_joined().await;
    assert_eq!(call.signaling.join_requests().len(), 1);

    // A kick and an identity switch land back to back: the second
    // rejoin supersedes the first before its payload is even emitted.
    call.handle
        .handle_participant_updates(TEST_CALL_ID, vec![left(SELF_PEER.0, FIRST_ENGINE_SSRC)])
        .await
        .unwrap();
    call.handle.rejoin_as(PeerId(7)).await.unwrap();
    settle().await;

    // The superseded payload is dropped: exactly one new join request,
    // carrying the switched identity.
    let joins = call.signaling.join_requests();
    assert_eq!(joins.len(), 2);
    assert_eq!(joins.get(1).unwrap().join_as, PeerId(7));
    assert_eq!(call.handle.state(), State::Joined);
    assert_eq!(call.engines.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hangup_during_rejoin_drops_stale_join_completion() {
    let call = TestCall::spawn_joined().await;
    call.signaling.set_join_delay(Duration::from_secs(3));

    call.push_updates(vec![left(SELF_PEER.0, FIRST_ENGINE_SSRC)])
        .await;
    assert_eq!(call.handle.state(), State::Joining);
    assert_eq!(call.signaling.join_requests().len(), 2);

    call.handle.hangup().await.unwrap();
    settle().await;

    // No confirmed server-side join to undo: straight to Ended.
    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.signaling.leave_count(), 0);

    // The held join response lands after the call already ended.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.handle.my_ssrc().await.unwrap(), 0);
    assert_eq!(call.signaling.join_requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_newer_self_edit_supersedes_inflight_edit() {
    let call = TestCall::spawn_joined().await;
    call.signaling.set_self_edit_delay(Duration::from_secs(2));
    // The reply to the superseded edit must never be applied.
    call.signaling.push_self_edit_err(reasons::FORBIDDEN);

    call.handle.set_muted(MuteState::Muted).await.unwrap();
    settle().await;
    call.handle.set_muted(MuteState::Active).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mute_edits: Vec<_> = call
        .signaling
        .self_edits()
        .into_iter()
        .filter(|edit| edit.kind == SelfEditKind::Mute)
        .collect();
    assert_eq!(mute_edits.len(), 2);
    assert!(!mute_edits.get(1).unwrap().muted);
    // The forbidden reply belonged to the replaced edit: no rejoin.
    assert_eq!(call.signaling.join_requests().len(), 1);
    assert_eq!(call.handle.state(), State::Joined);
    assert_eq!(call.handle.muted(), MuteState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_recording_stop_failure_keeps_call_alive() {
    let call = TestCall::spawn_joined().await;

    // Not recording: a stop request is not even sent.
    call.handle.toggle_recording(false, None).await.unwrap();
    settle().await;
    assert_eq!(recording_toggles(&call), 0);

    // The server reports a running recording.
    call.handle
        .handle_call_update(CallUpdate::Changed {
            id: TEST_CALL_ID,
            schedule_date: None,
            record_start_date: Some(1_700_000_100),
        })
        .await
        .unwrap();
    settle().await;

    call.signaling.push_recording_err("GROUPCALL_NOT_MODIFIED");
    call.handle.toggle_recording(false, None).await.unwrap();
    settle().await;
    assert_eq!(recording_toggles(&call), 1);
    assert_eq!(call.handle.state(), State::Joined);

    // The failed stop was rolled back, so retrying goes out again.
    call.handle.toggle_recording(false, None).await.unwrap();
    settle().await;
    assert_eq!(recording_toggles(&call), 2);
}

#[tokio::test(start_paused = true)]
async fn test_discard_failure_falls_back_to_hangup() {
    let call = TestCall::spawn_joined().await;
    call.signaling.push_discard_err("GROUPCALL_ALREADY_DISCARDED");

    call.handle.discard().await.unwrap();
    settle().await;

    assert_eq!(call.handle.state(), State::Ended);
    assert_eq!(call.signaling.leave_count(), 1);
    assert!(call.delegate.sounds().contains(&CallSound::Ended));
}

#[tokio::test(start_paused = true)]
async fn test_liveness_check_failure_rejoins() {
    let call = TestCall::spawn().await;
    assert_eq!(call.handle.state(), State::Connecting);
    call.signaling.push_check_err("GROUPCALL_INVALID");

    tokio::time::sleep(Duration::from_millis(4_100)).await;

    assert_eq!(call.signaling.check_count(), 1);
    assert_eq!(call.signaling.join_requests().len(), 2);
    assert_eq!(call.handle.state(), State::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_the_actor() {
    let call = TestCall::spawn_joined().await;

    call.handle.cancel();
    call.task.await.unwrap();

    assert!(call.handle.set_muted(MuteState::Muted).await.is_err());
}
