// End-to-end registry tests: bounded mpsc channels stand in for client
// sockets, so every assertion reads the exact frames a client would see.

use super::*;
use serde_json::Value;

fn test_registry() -> RoomRegistry {
    RoomRegistry::new(ConnRegistry::new(), MeetingStore::disabled(), HubMetrics::new())
}

fn connect(
    registry: &RoomRegistry,
    conn_id: &str,
    user_id: &str,
    name: &str,
) -> mpsc::Receiver<Arc<String>> {
    let (tx, rx) = mpsc::channel(64);
    registry
        .conns()
        .register(conn_id, Identity::new(user_id, name), tx, Arc::new(Notify::new()));
    rx
}

fn disconnect(registry: &RoomRegistry, conn_id: &str) {
    registry.conns().unregister(conn_id);
}

fn ident(user_id: &str, name: &str) -> Identity {
    Identity::new(user_id, name)
}

/// Drains every frame currently queued for a connection.
fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(json) = rx.try_recv() {
        frames.push(serde_json::from_str(&json).unwrap());
    }
    frames
}

fn frame_types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

fn find<'a>(frames: &'a [Value], kind: &str) -> Option<&'a Value> {
    frames.iter().find(|f| f["type"] == kind)
}

const ROOM: &str = "room-1";

async fn host_enters(registry: &RoomRegistry, conn_id: &str) -> mpsc::Receiver<Arc<String>> {
    let mut rx = connect(registry, conn_id, "u-host", "Hank");
    registry.request_join(ROOM, conn_id, &ident("u-host", "Hank"), false).await.unwrap();
    registry
        .join_room(ROOM, conn_id, &ident("u-host", "Hank"), MediaState::default())
        .await
        .unwrap();
    drain(&mut rx);
    rx
}

/// Admit a guest end-to-end (request, host approval, join) and drain
/// everyone's queues.
async fn guest_enters(
    registry: &RoomRegistry,
    conn_id: &str,
    user_id: &str,
    name: &str,
    host_conn: &str,
) -> mpsc::Receiver<Arc<String>> {
    let mut rx = connect(registry, conn_id, user_id, name);
    registry.request_join(ROOM, conn_id, &ident(user_id, name), false).await.unwrap();
    registry
        .approve(ROOM, host_conn, &ident("u-host", "Hank"), "u-host", user_id)
        .await
        .unwrap();
    registry
        .join_room(ROOM, conn_id, &ident(user_id, name), MediaState::default())
        .await
        .unwrap();
    drain(&mut rx);
    rx
}

// Scenario: host creates, guest requests, host approves.
#[tokio::test]
async fn test_host_creates_and_guest_is_approved() {
    let registry = test_registry();

    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    let frames = drain(&mut host_rx);
    let approved = find(&frames, "join-approved").expect("host gets join-approved");
    assert_eq!(approved["is_host"], true);

    let mut guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();

    let guest_frames = drain(&mut guest_rx);
    let waiting = find(&guest_frames, "waiting-for-approval").expect("guest waits");
    assert_eq!(waiting["position"], 1);
    assert_eq!(waiting["is_duplicate"], false);

    let host_frames = drain(&mut host_rx);
    let request = find(&host_frames, "join-request").expect("host notified");
    assert_eq!(request["user_id"], "u-guest");
    assert_eq!(request["user_name"], "Gina");

    registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest")
        .await
        .unwrap();

    let guest_frames = drain(&mut guest_rx);
    let approved = find(&guest_frames, "join-approved").expect("guest admitted");
    assert_eq!(approved["is_host"], false);

    let host_frames = drain(&mut host_rx);
    let processed = find(&host_frames, "join-request-processed").expect("host told");
    assert_eq!(processed["action"], "approved");
    assert_eq!(processed["user_id"], "u-guest");
}

// Scenario: rapid retry inside the dedup window notifies the host once.
#[tokio::test]
async fn test_rapid_retry_notifies_host_once() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let mut guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();

    let guest_frames = drain(&mut guest_rx);
    let waits: Vec<&Value> = guest_frames
        .iter()
        .filter(|f| f["type"] == "waiting-for-approval")
        .collect();
    assert_eq!(waits.len(), 2);
    assert_eq!(waits[0]["is_duplicate"], false);
    assert_eq!(waits[1]["is_duplicate"], true);

    let host_frames = drain(&mut host_rx);
    let requests: Vec<&Value> =
        host_frames.iter().filter(|f| f["type"] == "join-request").collect();
    assert_eq!(requests.len(), 1, "host must see exactly one join-request");
}

// Scenario: host refresh returns the queue as it stood.
#[tokio::test]
async fn test_host_refresh_preserves_queue() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let _guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();

    // host refreshes: old socket drops, new one re-requests
    registry.handle_disconnect("h1").await;
    disconnect(&registry, "h1");

    let mut host_rx2 = connect(&registry, "h2", "u-host", "Hank");
    registry.request_join(ROOM, "h2", &ident("u-host", "Hank"), true).await.unwrap();

    let frames = drain(&mut host_rx2);
    let approved = find(&frames, "join-approved").expect("host re-approved");
    assert_eq!(approved["is_host"], true);
    let pending = approved["pending_requests"].as_array().expect("queue snapshot");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["user_id"], "u-guest");
}

// Scenario: offer/answer relay between two admitted participants.
#[tokio::test]
async fn test_offer_answer_relay() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    let sdp = serde_json::json!({"type": "offer", "sdp": "v=0..."});
    registry
        .relay_signal("h1", "g1", relay::Signal::Offer {
            payload: sdp.clone(),
            user_name: Some("Hank".into()),
            user_id: Some("u-host".into()),
        })
        .await
        .unwrap();

    let frames = drain(&mut guest_rx);
    let offer = find(&frames, "offer").expect("guest receives offer");
    assert_eq!(offer["from"], "h1");
    assert_eq!(offer["payload"], sdp);

    registry
        .relay_signal("g1", "h1", relay::Signal::Answer {
            payload: serde_json::json!({"type": "answer", "sdp": "v=0..."}),
            user_name: Some("Gina".into()),
            user_id: Some("u-guest".into()),
        })
        .await
        .unwrap();

    let frames = drain(&mut host_rx);
    let answer = find(&frames, "answer").expect("host receives answer");
    assert_eq!(answer["from"], "g1");

    registry.relay_signal("g1", "h1", relay::Signal::Renegotiation).await.unwrap();
    let frames = drain(&mut host_rx);
    assert!(find(&frames, "renegotiation-needed").is_some());
}

#[tokio::test]
async fn test_relay_checks_membership_and_size() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;

    // target not in room
    let err = registry
        .relay_signal("h1", "nope", relay::Signal::Renegotiation)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::InvalidState(_)));

    // sender not in any room
    let _lurker_rx = connect(&registry, "x1", "u-x", "Xan");
    let err = registry
        .relay_signal("x1", "h1", relay::Signal::Renegotiation)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::InvalidState(_)));

    // payload one byte over the cap
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    let big = "x".repeat(relay::MAX_SIGNAL_PAYLOAD_BYTES - 1);
    let err = registry
        .relay_signal("h1", "g1", relay::Signal::IceCandidate {
            candidate: Value::String(big),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::PayloadTooLarge { .. }));
    assert!(drain(&mut guest_rx).is_empty(), "oversized frame must be dropped");
    drain(&mut host_rx);
}

// Scenario: transcription fanout plus history for a late joiner.
#[tokio::test]
async fn test_transcription_fanout_and_history() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut b_rx = guest_enters(&registry, "g1", "u-b", "Beth", "h1").await;
    let mut c_rx = guest_enters(&registry, "g2", "u-c", "Carl", "h1").await;
    drain(&mut host_rx);
    drain(&mut b_rx);

    registry
        .transcription_entry(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "e1", "hello", 1_000, 1.5, 0.92)
        .await
        .unwrap();

    for rx in [&mut b_rx, &mut c_rx] {
        let frames = drain(rx);
        let update = find(&frames, "transcription-update").expect("peers get the final");
        assert_eq!(update["entry_id"], "e1");
        assert_eq!(update["text"], "hello");
        assert_eq!(update["is_final"], true);
    }
    assert!(
        find(&drain(&mut host_rx), "transcription-update").is_none(),
        "speaker already has it locally"
    );

    // duplicate entry id is ignored entirely
    registry
        .transcription_entry(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "e1", "hello", 1_000, 1.5, 0.92)
        .await
        .unwrap();
    assert!(find(&drain(&mut b_rx), "transcription-update").is_none());

    // late joiner pulls history
    let mut d_rx = guest_enters(&registry, "g3", "u-d", "Dana", "h1").await;
    registry.transcription_history(ROOM, "g3").await.unwrap();
    let frames = drain(&mut d_rx);
    let history = find(&frames, "transcription-history").expect("history served");
    assert_eq!(history["count"], 1);
    assert_eq!(history["entries"][0]["entry_id"], "e1");
}

#[tokio::test]
async fn test_transcription_rejects_spoofed_speaker() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let _guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;

    let err = registry
        .transcription_entry(ROOM, "g1", &ident("u-guest", "Gina"), "u-host", "e1", "fake", 1_000, 1.0, 0.9)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));
    assert!(find(&drain(&mut host_rx), "transcription-update").is_none());
}

#[tokio::test]
async fn test_interim_overwrites_and_fans_out() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry
        .transcription_interim(ROOM, "g1", &ident("u-guest", "Gina"), "u-guest", "so I was")
        .await
        .unwrap();
    let frames = drain(&mut host_rx);
    let interim = find(&frames, "transcription-interim").expect("host sees caption");
    assert_eq!(interim["text"], "so I was");

    // the speaker's final clears the slot and reaches peers as an update
    registry
        .transcription_entry(ROOM, "g1", &ident("u-guest", "Gina"), "u-guest", "e1", "so I was saying", 2_000, 2.0, 0.88)
        .await
        .unwrap();
    let frames = drain(&mut host_rx);
    assert!(find(&frames, "transcription-update").is_some());
    assert!(drain(&mut guest_rx).is_empty(), "speaker gets no echo");
}

// Scenario: deny then reapply; denial is sticky for the room's life.
#[tokio::test]
async fn test_deny_then_reapply_stays_denied() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let mut guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    drain(&mut guest_rx);

    registry
        .deny(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest", Some("no"))
        .await
        .unwrap();

    let frames = drain(&mut guest_rx);
    let denied = find(&frames, "join-denied").expect("guest denied");
    assert_eq!(denied["reason"], "no");
    assert_eq!(denied["permanent"], false);

    let host_frames = drain(&mut host_rx);
    assert_eq!(find(&host_frames, "join-request-processed").unwrap()["action"], "denied");

    // reapplying hits the sticky denial without bothering the host
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    let frames = drain(&mut guest_rx);
    assert_eq!(find(&frames, "join-denied").unwrap()["reason"], "no");
    assert!(find(&drain(&mut host_rx), "join-request").is_none());
}

#[tokio::test]
async fn test_admit_all_waiting() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let mut g1_rx = connect(&registry, "g1", "u-g1", "Gina");
    let mut g2_rx = connect(&registry, "g2", "u-g2", "Gary");
    registry.request_join(ROOM, "g1", &ident("u-g1", "Gina"), false).await.unwrap();
    registry.request_join(ROOM, "g2", &ident("u-g2", "Gary"), false).await.unwrap();
    drain(&mut g1_rx);
    drain(&mut g2_rx);
    drain(&mut host_rx);

    registry
        .admit_all(ROOM, "h1", &ident("u-host", "Hank"), "u-host")
        .await
        .unwrap();

    assert!(find(&drain(&mut g1_rx), "join-approved").is_some());
    assert!(find(&drain(&mut g2_rx), "join-approved").is_some());
    let host_frames = drain(&mut host_rx);
    assert_eq!(find(&host_frames, "all-admitted").unwrap()["count"], 2);
}

#[tokio::test]
async fn test_admission_authorization_is_double_checked() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let _guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;

    let _waiter_rx = connect(&registry, "w1", "u-w", "Wes");
    registry.request_join(ROOM, "w1", &ident("u-w", "Wes"), false).await.unwrap();
    drain(&mut host_rx);

    // a guest claiming to be the host: asserted == authenticated, but not host
    let err = registry
        .approve(ROOM, "g1", &ident("u-guest", "Gina"), "u-guest", "u-w")
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));

    // a guest asserting the host's id: claim disagrees with authenticated identity
    let err = registry
        .approve(ROOM, "g1", &ident("u-guest", "Gina"), "u-host", "u-w")
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));

    // non-host cannot end the meeting either
    let err = registry
        .end_meeting(ROOM, "g1", &ident("u-guest", "Gina"))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));

    // the real host still can
    registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-w")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_join_room_requires_admission() {
    let registry = test_registry();
    let _host_rx = host_enters(&registry, "h1").await;

    let _guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    let err = registry
        .join_room(ROOM, "g1", &ident("u-guest", "Gina"), MediaState::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));
}

#[tokio::test]
async fn test_user_joined_excludes_the_joiner() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;

    let mut guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest")
        .await
        .unwrap();
    drain(&mut guest_rx);
    drain(&mut host_rx);

    registry
        .join_room(ROOM, "g1", &ident("u-guest", "Gina"), MediaState::default())
        .await
        .unwrap();

    let guest_frames = drain(&mut guest_rx);
    let existing = find(&guest_frames, "existing-participants").expect("joiner gets roster");
    assert_eq!(existing["participants"].as_array().unwrap().len(), 1);
    assert_eq!(existing["participants"][0]["user_id"], "u-host");
    assert!(find(&guest_frames, "user-joined").is_none(), "joiner never sees their own join");

    let host_frames = drain(&mut host_rx);
    let joined = find(&host_frames, "user-joined").expect("peers see the join");
    assert_eq!(joined["user_id"], "u-guest");
    assert_eq!(joined["conn_id"], "g1");
}

#[tokio::test]
async fn test_rejoin_clears_stale_conn_with_hint() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let _old_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    // same user comes back on a fresh socket without a clean leave
    let mut new_rx = connect(&registry, "g2", "u-guest", "Gina");
    registry
        .join_room(ROOM, "g2", &ident("u-guest", "Gina"), MediaState::default())
        .await
        .unwrap();

    let host_frames = drain(&mut host_rx);
    let hint = find(&host_frames, "user-disconnected").expect("stale conn hint");
    assert_eq!(hint["conn_id"], "g1");
    assert_eq!(hint["user_id"], "u-guest");
    let joined = find(&host_frames, "user-joined").expect("new conn announced");
    assert_eq!(joined["conn_id"], "g2");

    let frames = drain(&mut new_rx);
    assert!(find(&frames, "existing-participants").is_some());
}

#[tokio::test]
async fn test_leave_room_announces_and_empties_out() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.leave_room(ROOM, "g1").await.unwrap();
    let frames = drain(&mut host_rx);
    let left = find(&frames, "user-left").expect("peers told");
    assert_eq!(left["user_id"], "u-guest");
    assert!(find(&frames, "host-left").is_none());
    assert!(drain(&mut guest_rx).is_empty(), "the leaver gets no user-left");

    // explicit exit of the last participant destroys the room immediately
    registry.leave_room(ROOM, "h1").await.unwrap();
    assert_eq!(registry.room_count(), 0);
    // repeated leave reports the room as gone
    assert!(matches!(
        registry.leave_room(ROOM, "h1").await.unwrap_err(),
        HubError::UnknownRoom(_)
    ));
}

#[tokio::test]
async fn test_disconnect_emits_user_left_and_host_left() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.handle_disconnect("h1").await;
    disconnect(&registry, "h1");

    let frames = drain(&mut guest_rx);
    assert!(find(&frames, "user-left").is_some());
    let host_left = find(&frames, "host-left").expect("host loss announced");
    assert_eq!(host_left["user_id"], "u-host");
}

#[tokio::test]
async fn test_end_meeting_evicts_participants_and_pending() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    let mut waiter_rx = connect(&registry, "w1", "u-w", "Wes");
    registry.request_join(ROOM, "w1", &ident("u-w", "Wes"), false).await.unwrap();
    drain(&mut host_rx);
    drain(&mut waiter_rx);

    registry.end_meeting(ROOM, "h1", &ident("u-host", "Hank")).await.unwrap();

    assert!(find(&drain(&mut host_rx), "meeting-ended").is_some());
    assert!(find(&drain(&mut guest_rx), "meeting-ended").is_some());
    assert!(
        find(&drain(&mut waiter_rx), "meeting-ended").is_some(),
        "waiting requesters are evicted too"
    );
    assert_eq!(registry.room_count(), 0);

    // approvals and denials do not survive destruction
    registry.request_join(ROOM, "w1", &ident("u-w", "Wes"), false).await.unwrap();
    let frames = drain(&mut waiter_rx);
    assert_eq!(
        find(&frames, "join-approved").unwrap()["is_host"],
        true,
        "first requester of the fresh room becomes host"
    );
}

#[tokio::test]
async fn test_waiting_socket_survives_disconnect_and_rebinds() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let _g_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();

    // waiting socket drops: the queue entry survives with a null conn
    registry.handle_disconnect("g1").await;
    disconnect(&registry, "g1");
    drain(&mut host_rx);

    // a fresh socket reattaches without resetting the clock or re-notifying
    let mut g2_rx = connect(&registry, "g2", "u-guest", "Gina");
    registry
        .update_waiting_conn(ROOM, "g2", &ident("u-guest", "Gina"), "u-guest")
        .await
        .unwrap();
    assert!(find(&drain(&mut host_rx), "join-request").is_none());

    registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest")
        .await
        .unwrap();
    assert!(find(&drain(&mut g2_rx), "join-approved").is_some());
}

#[tokio::test]
async fn test_approving_a_departed_waiter_is_silent() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();

    let _g_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    registry.handle_disconnect("g1").await;
    disconnect(&registry, "g1");
    drain(&mut host_rx);

    // approval targets a null conn: no crash, host still gets confirmation
    registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest")
        .await
        .unwrap();
    assert!(find(&drain(&mut host_rx), "join-request-processed").is_some());
}

#[tokio::test]
async fn test_sweep_expires_stale_requests() {
    let registry = test_registry();
    let mut host_rx = connect(&registry, "h1", "u-host", "Hank");
    registry.request_join(ROOM, "h1", &ident("u-host", "Hank"), false).await.unwrap();
    drain(&mut host_rx);

    let mut guest_rx = connect(&registry, "g1", "u-guest", "Gina");
    registry.request_join(ROOM, "g1", &ident("u-guest", "Gina"), false).await.unwrap();
    drain(&mut guest_rx);

    // a fresh request survives the sweep
    registry.sweep_expired().await;
    assert!(find(&drain(&mut guest_rx), "join-request-expired").is_none());

    // age it past the TTL
    {
        let room_lock = registry.get_room(ROOM).unwrap();
        let mut room = room_lock.write().await;
        let backdated = now_ms() - PENDING_TTL_MS;
        room.admission.backdate_pending("u-guest", backdated);
    }
    registry.sweep_expired().await;
    assert!(find(&drain(&mut guest_rx), "join-request-expired").is_some());

    // the queue entry is gone: approving now is an invalid state
    let err = registry
        .approve(ROOM, "h1", &ident("u-host", "Hank"), "u-host", "u-guest")
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::InvalidState(_)));
}

#[tokio::test]
async fn test_toggle_media_reaches_peers_only() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.toggle_media(ROOM, "g1", MediaKind::Audio, false).await.unwrap();

    let host_frames = drain(&mut host_rx);
    let toggle = find(&host_frames, "user-media-toggle").expect("peers notified");
    assert_eq!(toggle["media_type"], "audio");
    assert_eq!(toggle["enabled"], false);
    assert_eq!(toggle["conn_id"], "g1");
    assert!(drain(&mut guest_rx).is_empty(), "toggler gets no echo");
}

#[tokio::test]
async fn test_chat_echoes_to_whole_room() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.chat(ROOM, "g1", "hello all").await.unwrap();

    for rx in [&mut host_rx, &mut guest_rx] {
        let frames = drain(rx);
        let msg = find(&frames, "receive-message").expect("chat echo");
        assert_eq!(msg["message"], "hello all");
        assert_eq!(msg["user_name"], "Gina");
    }

    let err = registry.chat(ROOM, "g1", &"x".repeat(5000)).await.unwrap_err();
    assert!(matches!(err, HubError::PayloadTooLarge { .. }));
}

#[tokio::test]
async fn test_recording_status_reaches_whole_room() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.recording_status(ROOM, "h1", true).await.unwrap();

    for rx in [&mut host_rx, &mut guest_rx] {
        let frames = drain(rx);
        let status = find(&frames, "recording-status-changed").expect("status fanout");
        assert_eq!(status["is_recording"], true);
        assert_eq!(status["user_name"], "Hank");
    }
}

#[tokio::test]
async fn test_meeting_start_time_is_set_once() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    // unset reads back as null
    registry.request_meeting_start_time(ROOM, "g1").await.unwrap();
    let frames = drain(&mut guest_rx);
    assert!(find(&frames, "meeting-start-time").unwrap()["start_time"].is_null());

    registry.set_meeting_start_time(ROOM, &ident("u-host", "Hank"), 5_000).await.unwrap();
    // a later write is ignored
    registry.set_meeting_start_time(ROOM, &ident("u-host", "Hank"), 9_000).await.unwrap();

    registry.request_meeting_start_time(ROOM, "g1").await.unwrap();
    let frames = drain(&mut guest_rx);
    assert_eq!(find(&frames, "meeting-start-time").unwrap()["start_time"], 5_000);

    // guests cannot set it
    let err = registry
        .set_meeting_start_time(ROOM, &ident("u-guest", "Gina"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Authorization(_)));
}

#[tokio::test]
async fn test_unknown_room_is_reported() {
    let registry = test_registry();
    let _rx = connect(&registry, "c1", "u-1", "Uma");
    let err = registry
        .approve("ghost", "c1", &ident("u-1", "Uma"), "u-1", "u-2")
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::UnknownRoom(_)));
    let err = registry.transcription_history("ghost", "c1").await.unwrap_err();
    assert!(matches!(err, HubError::UnknownRoom(_)));
}

#[tokio::test]
async fn test_rooms_are_independent() {
    let registry = test_registry();

    let mut h1_rx = connect(&registry, "h1", "u-h1", "Hana");
    registry.request_join("room-a", "h1", &ident("u-h1", "Hana"), false).await.unwrap();
    let mut h2_rx = connect(&registry, "h2", "u-h2", "Hugo");
    registry.request_join("room-b", "h2", &ident("u-h2", "Hugo"), false).await.unwrap();

    assert_eq!(find(&drain(&mut h1_rx), "join-approved").unwrap()["is_host"], true);
    assert_eq!(find(&drain(&mut h2_rx), "join-approved").unwrap()["is_host"], true);
    assert_eq!(registry.room_count(), 2);

    registry.end_meeting("room-a", "h1", &ident("u-h1", "Hana")).await.unwrap();
    assert_eq!(registry.room_count(), 1);
    assert!(registry.get_room("room-b").is_ok());
}

#[tokio::test]
async fn test_poison_room_destroys_with_reason() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    drain(&mut host_rx);

    registry.poison_room(ROOM).await;

    for rx in [&mut host_rx, &mut guest_rx] {
        let frames = drain(rx);
        let ended = find(&frames, "meeting-ended").expect("members evicted");
        assert_eq!(ended["reason"], "internal error");
    }
    assert_eq!(registry.room_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_all_rooms() {
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut h2_rx = connect(&registry, "h2", "u-h2", "Hugo");
    registry.request_join("room-b", "h2", &ident("u-h2", "Hugo"), false).await.unwrap();
    registry
        .join_room("room-b", "h2", &ident("u-h2", "Hugo"), MediaState::default())
        .await
        .unwrap();
    drain(&mut h2_rx);

    registry.shutdown().await;
    assert_eq!(registry.room_count(), 0);
    assert_eq!(
        find(&drain(&mut host_rx), "meeting-ended").unwrap()["reason"],
        "server shutting down"
    );
    assert_eq!(
        find(&drain(&mut h2_rx), "meeting-ended").unwrap()["reason"],
        "server shutting down"
    );
}

#[tokio::test]
async fn test_broadcast_order_is_total_per_room() {
    // roomwide broadcasts preserve one total order: finals appended
    // back-to-back arrive in append order for every recipient
    let registry = test_registry();
    let mut host_rx = host_enters(&registry, "h1").await;
    let mut guest_rx = guest_enters(&registry, "g1", "u-guest", "Gina", "h1").await;
    let mut observer_rx = guest_enters(&registry, "g2", "u-obs", "Omar", "h1").await;
    drain(&mut host_rx);
    drain(&mut guest_rx);

    for (id, text) in [("e1", "first"), ("e2", "second"), ("e3", "third")] {
        registry
            .transcription_entry(ROOM, "h1", &ident("u-host", "Hank"), "u-host", id, text, 1_000, 1.0, 0.9)
            .await
            .unwrap();
    }

    for rx in [&mut guest_rx, &mut observer_rx] {
        let frames = drain(rx);
        let texts: Vec<&str> = frames
            .iter()
            .filter(|f| f["type"] == "transcription-update")
            .map(|f| f["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }
    assert_eq!(frame_types(&drain(&mut host_rx)), Vec::<&str>::new());
}
