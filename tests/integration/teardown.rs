//! Teardown, server-initiated state changes, and notification reconciliation.

use crate::helpers::*;
use std::sync::atomic::Ordering;
use voxgate::VoiceError;
use voxgate::transcriber::protocol::{ConnectInfo, DisconnectInfo, UserJoinInfo};
use voxgate::transcriber::{Transcriber, TranscriberNotification};
use voxgate::voice::{ChannelId, ConnectionStatus, MoveOutcome, UserId};

#[tokio::test]
async fn transcriber_exit_tears_down_connection() {
    let h = harness(true);
    connect_fully(&h).await;
    assert!(eventually(|| h.connection.is_connected()).await);

    h.transcriber.crash();

    assert!(
        eventually(|| h.connection.status() == ConnectionStatus::Disconnected).await,
        "connection was not torn down"
    );
    assert!(eventually(|| h.responder.stops.load(Ordering::SeqCst) == 1).await);
    assert!(!h.connection.is_connected());
    assert_eq!(h.gateway.leaves(), 1);
    assert_eq!(h.transcriber.stops(), 1);
    assert_eq!(h.connection.session_id(), None);
}

#[tokio::test]
async fn disconnect_notification_from_running_transcriber_tears_down() {
    let h = harness(true);
    connect_fully(&h).await;

    h.transcriber.emit(vec![TranscriberNotification::Disconnect(DisconnectInfo {
        kind: Some("runtime".to_owned()),
        reason: Some("voice server closed".to_owned()),
        ..DisconnectInfo::default()
    })]);

    assert!(eventually(|| h.connection.status() == ConnectionStatus::Disconnected).await);
    assert!(eventually(|| !h.transcriber.is_running()).await);
}

#[tokio::test]
async fn disconnect_from_previous_attempt_is_ignored() {
    let h = harness(true);
    connect_fully(&h).await;
    h.connection.disconnect(true).await;
    connect_fully(&h).await;
    assert!(eventually(|| h.connection.is_connected()).await);

    h.transcriber.emit_from_launch(
        0,
        vec![TranscriberNotification::Disconnect(DisconnectInfo::default())],
    );
    // Give the deferred task a chance to run.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(h.connection.status(), ConnectionStatus::Connected);
    assert_eq!(h.gateway.leaves(), 1);
}

#[tokio::test]
async fn unforced_disconnect_is_noop_when_not_connected() {
    let h = harness(true);
    h.connection.disconnect(false).await;
    assert!(h.gateway.requests().is_empty());
    assert_eq!(h.connection.status(), ConnectionStatus::Idle);
    assert_eq!(h.transcriber.stops(), 0);
}

#[tokio::test]
async fn failed_leave_request_still_cleans_up() {
    let h = harness(true);
    connect_fully(&h).await;
    assert!(eventually(|| h.connection.is_connected()).await);
    h.gateway.fail_leave.store(true, Ordering::SeqCst);

    h.connection.disconnect(false).await;

    assert_eq!(h.gateway.leaves(), 1);
    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert!(!h.transcriber.is_running());
    assert_eq!(h.responder.stops.load(Ordering::SeqCst), 1);
    assert!(!h.connection.identity().is_complete());
    assert!(!h.connection.handshake_signals().state);
}

#[tokio::test]
async fn is_connected_needs_transcriber_connect_notification() {
    let h = harness(false);
    connect_fully(&h).await;

    assert_eq!(h.connection.status(), ConnectionStatus::Connected);
    assert!(h.transcriber.is_running());
    assert!(!h.connection.is_connected());

    h.transcriber
        .emit(vec![TranscriberNotification::Reconnect(ConnectInfo::default())]);
    assert!(eventually(|| h.connection.is_connected()).await);
}

#[tokio::test]
async fn removal_by_server_disconnects() {
    let h = harness(true);
    connect_fully(&h).await;

    h.connection
        .on_voice_state_update(state_update("session-1", None))
        .await
        .unwrap();

    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert!(!h.transcriber.is_running());
    assert_eq!(h.gateway.leaves(), 1);
}

#[tokio::test]
async fn server_move_to_voice_channel_is_adopted() {
    let h = harness(true);
    connect_fully(&h).await;

    h.connection
        .on_voice_state_update(state_update("session-2", Some(OTHER_VOICE)))
        .await
        .unwrap();

    assert_eq!(h.connection.channel_id(), OTHER_VOICE);
    assert_eq!(h.connection.session_id().as_deref(), Some("session-2"));
    assert_eq!(h.connection.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn server_move_to_unknown_or_text_channel_is_ignored() {
    let h = harness(true);
    connect_fully(&h).await;

    h.connection
        .on_voice_state_update(state_update("session-2", Some(ChannelId(999))))
        .await
        .unwrap();
    assert_eq!(h.connection.channel_id(), CHANNEL);

    h.connection
        .on_voice_state_update(state_update("session-3", Some(TEXT_CHANNEL)))
        .await
        .unwrap();
    assert_eq!(h.connection.channel_id(), CHANNEL);
    assert_eq!(h.connection.session_id().as_deref(), Some("session-3"));
    assert_eq!(h.connection.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn move_to_channel_moves_gateway_only() {
    let h = harness(true);
    connect_fully(&h).await;

    let outcome = h.connection.move_to(Some(OTHER_VOICE)).await.unwrap();

    assert_eq!(outcome, MoveOutcome::GatewayOnly);
    let last = *h.gateway.requests().last().unwrap();
    assert_eq!(last.channel_id, Some(OTHER_VOICE));
    assert!(h.transcriber.is_running());
    assert_eq!(h.transcriber.launches().len(), 1);
}

#[tokio::test]
async fn move_to_nowhere_leaves() {
    let h = harness(true);
    connect_fully(&h).await;

    let outcome = h.connection.move_to(None).await.unwrap();

    assert_eq!(outcome, MoveOutcome::Left);
    assert_eq!(h.connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.gateway.leaves(), 1);
}

#[tokio::test]
async fn move_to_reports_gateway_failure() {
    let h = harness(true);
    connect_fully(&h).await;
    h.gateway.fail_join.store(true, Ordering::SeqCst);

    let err = h.connection.move_to(Some(OTHER_VOICE)).await.unwrap_err();
    assert!(matches!(err, VoiceError::Gateway(_)), "got {err:?}");
}

#[tokio::test]
async fn reconnect_is_not_supported() {
    let h = harness(true);
    connect_fully(&h).await;

    let err = h.connection.reconnect().unwrap_err();
    assert!(matches!(err, VoiceError::NotSupported { operation: "reconnect" }));
    assert_eq!(h.connection.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn transcripts_reach_sink_in_order() {
    let h = harness(true);
    connect_fully(&h).await;

    h.transcriber.emit(vec![
        transcript(1, "first"),
        TranscriberNotification::UserJoin(UserJoinInfo {
            user_id: UserId(2),
            ssrc: Some(7),
        }),
        transcript(2, "second"),
        transcript(1, "third"),
    ]);

    assert!(eventually(|| h.sink.texts().len() == 3).await);
    assert_eq!(h.sink.texts(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn unrecognized_notification_is_ignored() {
    let h = harness(true);
    connect_fully(&h).await;
    assert!(eventually(|| h.connection.is_connected()).await);

    h.transcriber.emit(vec![
        TranscriberNotification::Unrecognized {
            kind: "SpeakingStarted".to_owned(),
        },
        transcript(1, "after"),
    ]);

    assert!(eventually(|| h.sink.texts() == vec!["after"]).await);
    assert!(h.connection.is_connected());
}
