//! End-to-end session tests against the in-memory broker.
//!
//! These drive a real `SessionHandle` through the transport supervisor, STOMP
//! codec, router, presence tracker and conversation log, playing the broker
//! side by hand.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::{SessionEvent, SessionHandle, SessionState};
use crate::config::SessionConfig;
use crate::conversation::{Delivery, LogEntry};
use crate::error::{DirectoryFetchError, PublishError, SessionError};
use crate::model::{ConversationKey, EventKind, Identity};
use crate::test_helpers::{BrokerPeer, FakeDirectory, MemoryBroker, TEST_TIMEOUT, ids, test_session_config};
use crate::transport::Credentials;
use crate::transport::stomp::{Command, Frame};

const PUBLIC: &str = "/topic/public";
const ALICE_QUEUE: &str = "/user/alice/queue/messages";

fn alice() -> Identity {
    Identity::new("alice", "Alice")
}

fn start_with(config: SessionConfig, broker: &MemoryBroker, directory: Arc<FakeDirectory>) -> SessionHandle {
    SessionHandle::start(
        config,
        alice(),
        Credentials {
            login: "alice".into(),
            token: Some("opaque-token".into()),
        },
        broker.connector(),
        directory,
    )
    .expect("session should start")
}

fn start(broker: &MemoryBroker, directory: Arc<FakeDirectory>) -> SessionHandle {
    start_with(test_session_config(), broker, directory)
}

async fn wait_for_state(handle: &SessionHandle, want: SessionState) {
    let mut state = handle.watch_state();
    timeout(TEST_TIMEOUT, state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}"))
        .expect("session ended");
}

async fn wait_for_roster(handle: &SessionHandle, want: &[&str]) {
    let result = timeout(TEST_TIMEOUT, async {
        loop {
            let roster: Vec<String> = handle
                .roster()
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.identity.id)
                .collect();
            if roster == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "roster never became {want:?}");
}

async fn wait_for_entries(handle: &SessionHandle, key: ConversationKey, count: usize) -> Vec<LogEntry> {
    timeout(TEST_TIMEOUT, async {
        loop {
            let entries = handle.conversation(key.clone()).await.unwrap();
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("conversation {key} never reached {count} entries"))
}

fn payload(frame: &Frame) -> serde_json::Value {
    serde_json::from_str(&frame.body).expect("SEND body is JSON")
}

/// Broker side of an active session.
struct Joined {
    peer: BrokerPeer,
    public_sub: String,
    private_sub: String,
}

impl Joined {
    fn say(&self, json: &str) {
        self.peer.deliver(&self.public_sub, PUBLIC, json);
    }

    fn whisper(&self, json: &str) {
        self.peer.deliver(&self.private_sub, ALICE_QUEUE, json);
    }
}

/// Read both SUBSCRIBE frames and acknowledge them. Returns (public, private) ids.
async fn acknowledge_subscriptions(peer: &mut BrokerPeer) -> (Frame, Frame) {
    let public = peer.expect_frame().await;
    let private = peer.expect_frame().await;
    assert_eq!(public.command, Command::Subscribe);
    assert_eq!(public.get("destination"), Some(PUBLIC));
    assert_eq!(private.command, Command::Subscribe);
    assert_eq!(private.get("destination"), Some(ALICE_QUEUE));
    (public, private)
}

fn send_receipts(peer: &BrokerPeer, frames: &[&Frame]) {
    for frame in frames {
        peer.send_receipt(frame.get("receipt").expect("SUBSCRIBE asks for a receipt"));
    }
}

/// Accept the first link and take the session all the way to Active.
async fn join(broker: &mut MemoryBroker, handle: &SessionHandle) -> Joined {
    let mut peer = broker.accept().await;
    peer.handshake().await;
    let (public, private) = acknowledge_subscriptions(&mut peer).await;
    let join = peer.expect_frame().await;
    assert_eq!(join.get("destination"), Some("/app/chat.addUser"));
    send_receipts(&peer, &[&public, &private]);
    wait_for_state(handle, SessionState::Active).await;
    Joined {
        public_sub: public.get("id").unwrap().to_string(),
        private_sub: private.get("id").unwrap().to_string(),
        peer,
    }
}

#[tokio::test]
async fn start_subscribes_then_announces_join_once() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));

    let mut peer = broker.accept().await;
    let connect = peer.handshake().await;
    assert_eq!(connect.get("login"), Some("alice"));
    assert_eq!(connect.get("Authorization"), Some("Bearer opaque-token"));
    wait_for_state(&handle, SessionState::Joining).await;

    let (public, private) = acknowledge_subscriptions(&mut peer).await;
    let join = peer.expect_frame().await;
    assert_eq!(join.command, Command::Send);
    assert_eq!(join.get("destination"), Some("/app/chat.addUser"));
    let body = payload(&join);
    assert_eq!(body["sender"], "alice");
    assert_eq!(body["type"], "JOIN");
    assert!(body.get("recipient").is_none());

    // Still joining until every receipt is in.
    send_receipts(&peer, &[&public]);
    peer.expect_silence(Duration::from_millis(30)).await;
    assert_eq!(handle.state(), SessionState::Joining);
    send_receipts(&peer, &[&private]);
    wait_for_state(&handle, SessionState::Active).await;
}

#[tokio::test]
async fn roster_follows_snapshot_and_live_events() {
    let mut broker = MemoryBroker::new();
    let directory = Arc::new(FakeDirectory::new(ids(&["alice", "bob"])));
    let handle = start(&broker, directory);
    let joined = join(&mut broker, &handle).await;

    wait_for_roster(&handle, &["bob"]).await;
    joined.say(r#"{"sender":"carol","type":"JOIN"}"#);
    wait_for_roster(&handle, &["bob", "carol"]).await;
    joined.say(r#"{"sender":"bob","type":"LEAVE"}"#);
    wait_for_roster(&handle, &["carol"]).await;

    // A duplicate Leave is harmless.
    joined.say(r#"{"sender":"bob","type":"LEAVE"}"#);
    joined.say(r#"{"sender":"alice","type":"JOIN"}"#);
    let entries = wait_for_entries(&handle, ConversationKey::Broadcast, 4).await;
    assert_eq!(entries[0].event.display_text(), "carol joined the chat");
    assert_eq!(entries[1].event.display_text(), "bob left the chat");
    wait_for_roster(&handle, &["carol"]).await;
}

#[tokio::test]
async fn private_send_goes_to_correspondent_conversation() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let mut joined = join(&mut broker, &handle).await;

    let entry = handle.send("hi", Some("bob")).await.unwrap();
    assert_eq!(entry.event.sender, "alice");
    assert_eq!(entry.event.recipient.as_deref(), Some("bob"));
    assert_eq!(entry.event.kind, EventKind::Chat);
    assert_eq!(entry.event.body.as_deref(), Some("hi"));
    assert_eq!(entry.delivery, Delivery::Sent);

    let sent = joined.peer.expect_frame().await;
    assert_eq!(sent.get("destination"), Some("/app/chat.sendMessage"));
    assert_eq!(payload(&sent)["recipient"], "bob");

    let bob = handle.conversation(ConversationKey::direct("bob")).await.unwrap();
    assert_eq!(bob, vec![entry]);
    assert!(
        handle
            .conversation(ConversationKey::Broadcast)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn send_while_not_active_is_unconfirmed_and_not_retried() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    assert_eq!(handle.state(), SessionState::Connecting);

    let err = handle.send("too early", None).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Publish(PublishError::NotActive { .. })
    ));
    let log = handle.conversation(ConversationKey::Broadcast).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].delivery, Delivery::Unconfirmed);
    assert_eq!(log[0].event.body.as_deref(), Some("too early"));

    let mut joined = join(&mut broker, &handle).await;
    joined.peer.expect_silence(Duration::from_millis(50)).await;
    let log = handle.conversation(ConversationKey::Broadcast).await.unwrap();
    assert_eq!(log[0].delivery, Delivery::Unconfirmed);
}

#[tokio::test]
async fn reconnect_replays_subscriptions_without_second_join() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;
    joined.say(r#"{"sender":"bob","type":"CHAT","content":"before"}"#);
    wait_for_entries(&handle, ConversationKey::Broadcast, 1).await;

    drop(joined);
    wait_for_state(&handle, SessionState::Connecting).await;

    let mut peer = broker.accept().await;
    peer.handshake().await;
    let (public, private) = acknowledge_subscriptions(&mut peer).await;
    assert_eq!(public.get("id"), Some("sub-1"));
    assert_eq!(private.get("id"), Some("sub-2"));
    send_receipts(&peer, &[&public, &private]);
    wait_for_state(&handle, SessionState::Active).await;
    peer.expect_silence(Duration::from_millis(50)).await;
    assert_eq!(broker.attempts(), 2);

    peer.deliver("sub-1", PUBLIC, r#"{"sender":"bob","type":"CHAT","content":"after"}"#);
    let entries = wait_for_entries(&handle, ConversationKey::Broadcast, 2).await;
    assert!(!entries[0].after_gap);
    assert!(entries[1].after_gap);
}

#[tokio::test]
async fn echo_confirms_own_broadcast() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let mut joined = join(&mut broker, &handle).await;
    let mut events = handle.subscribe();

    let entry = handle.send("hello all", None).await.unwrap();
    let sent = joined.peer.expect_frame().await;
    joined.say(&sent.body);

    let confirmed = timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::DeliveryChanged { key, entry } => return (key, entry),
                _ => continue,
            }
        }
    })
    .await
    .expect("no delivery change");
    assert_eq!(confirmed.0, ConversationKey::Broadcast);
    assert_eq!(confirmed.1.seq, entry.seq);
    assert_eq!(confirmed.1.delivery, Delivery::Confirmed);
    assert_eq!(handle.conversation(ConversationKey::Broadcast).await.unwrap().len(), 1);
}

#[tokio::test]
async fn private_traffic_is_filtered() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;

    // Addressed to someone else: dropped.
    joined.whisper(r#"{"sender":"bob","recipient":"mallory","type":"CHAT","content":"psst"}"#);
    // Relayed on the public topic between other people: skipped.
    joined.say(r#"{"sender":"bob","recipient":"carol","type":"CHAT","content":"hey carol"}"#);
    joined.whisper(r#"{"sender":"bob","recipient":"alice","type":"CHAT","content":"hey alice"}"#);

    let bob = wait_for_entries(&handle, ConversationKey::direct("bob"), 1).await;
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].event.body.as_deref(), Some("hey alice"));
    assert_eq!(bob[0].delivery, Delivery::Received);
    assert_eq!(
        handle.conversations().await.unwrap(),
        vec![ConversationKey::direct("bob")]
    );
}

#[tokio::test]
async fn private_message_on_public_topic_reaches_direct_conversation() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;

    let dm = r#"{"sender":"bob","recipient":"alice","type":"CHAT","content":"via topic","timestamp":"2024-05-01T10:00:00.000Z"}"#;
    joined.say(dm);
    // The same message on the private queue is not logged twice.
    joined.whisper(dm);
    joined.whisper(
        r#"{"sender":"bob","recipient":"alice","type":"CHAT","content":"via queue","timestamp":"2024-05-01T10:00:01.000Z"}"#,
    );

    let bob = wait_for_entries(&handle, ConversationKey::direct("bob"), 2).await;
    let bodies: Vec<_> = bob.iter().map(|e| e.event.body.clone().unwrap()).collect();
    assert_eq!(bodies, vec!["via topic", "via queue"]);
    assert!(bob.iter().all(|e| e.delivery == Delivery::Received));
    assert!(
        handle
            .conversation(ConversationKey::Broadcast)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn burst_larger_than_event_capacity_is_delivered_in_full() {
    let mut broker = MemoryBroker::new();
    let mut config = test_session_config();
    config.transport.event_capacity = 16;
    let handle = start_with(config, &broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;

    let burst: String = (0..40)
        .map(|n| {
            Frame::new(Command::Message)
                .header("subscription", joined.public_sub.as_str())
                .header("destination", PUBLIC)
                .body(format!(r#"{{"sender":"bob","type":"CHAT","content":"{n}"}}"#))
                .encode()
        })
        .collect();
    joined.peer.send_raw(&burst);

    let entries = wait_for_entries(&handle, ConversationKey::Broadcast, 40).await;
    let bodies: Vec<String> = entries.iter().map(|e| e.event.body.clone().unwrap()).collect();
    let expected: Vec<String> = (0..40).map(|n| n.to_string()).collect();
    assert_eq!(bodies, expected);
    assert!(entries.iter().all(|e| !e.after_gap));
    assert_eq!(handle.state(), SessionState::Active);
}

#[tokio::test]
async fn leave_during_initial_fetch_beats_the_snapshot() {
    let mut broker = MemoryBroker::new();
    let directory = Arc::new(FakeDirectory::gated(ids(&["alice", "bob"])));
    let handle = start(&broker, directory.clone());
    let joined = join(&mut broker, &handle).await;

    // The initial snapshot is still in flight while these arrive.
    joined.say(r#"{"sender":"carol","type":"JOIN"}"#);
    joined.say(r#"{"sender":"bob","type":"LEAVE"}"#);
    wait_for_entries(&handle, ConversationKey::Broadcast, 2).await;
    wait_for_roster(&handle, &["carol"]).await;

    let refresh = tokio::spawn({
        let handle = handle.clone();
        async move { handle.refresh_roster().await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    directory.release();

    let roster = timeout(TEST_TIMEOUT, refresh).await.unwrap().unwrap().unwrap();
    let roster: Vec<String> = roster.into_iter().map(|e| e.identity.id).collect();
    assert_eq!(roster, vec!["carol"]);
    assert_eq!(directory.calls(), 1);
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_session_continues() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;

    joined.say("{not json");
    joined.say(r#"{"sender":"bob","type":"WAVE"}"#);
    joined.say(r#"{"sender":"bob","type":"CHAT","content":"still here"}"#);
    let entries = wait_for_entries(&handle, ConversationKey::Broadcast, 1).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(handle.state(), SessionState::Active);
}

#[tokio::test]
async fn logout_announces_leave_once_and_ends_session() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let mut joined = join(&mut broker, &handle).await;

    handle.logout().await.unwrap();
    handle.logout().await.unwrap();

    let leave = joined.peer.expect_frame().await;
    assert_eq!(leave.get("destination"), Some("/app/chat.removeUser"));
    let body = payload(&leave);
    assert_eq!(body["sender"], "alice");
    assert_eq!(body["type"], "LEAVE");
    assert_eq!(joined.peer.expect_frame().await.command, Command::Disconnect);

    timeout(TEST_TIMEOUT, handle.closed())
        .await
        .expect("session did not end");
    assert_eq!(handle.state(), SessionState::Disconnected);
    assert!(matches!(
        handle.send("anyone?", None).await,
        Err(SessionError::Ended)
    ));
    handle.logout().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(broker.try_accept().is_none());
}

#[tokio::test]
async fn logout_while_connecting_skips_leave() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));

    let mut peer = broker.accept().await;
    assert_eq!(peer.expect_frame().await.command, Command::Connect);
    // No CONNECTED yet: the session is still connecting.
    handle.logout().await.unwrap();
    timeout(TEST_TIMEOUT, handle.closed())
        .await
        .expect("session did not end");
    peer.expect_silence(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn dropping_every_handle_logs_out() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let mut joined = join(&mut broker, &handle).await;
    let mut state = handle.watch_state();
    drop(handle);

    let leave = joined.peer.expect_frame().await;
    assert_eq!(leave.get("destination"), Some("/app/chat.removeUser"));
    timeout(TEST_TIMEOUT, async { while state.changed().await.is_ok() {} })
        .await
        .expect("session did not end");
}

#[tokio::test]
async fn refresh_requests_share_one_fetch() {
    let mut broker = MemoryBroker::new();
    let directory = Arc::new(FakeDirectory::gated(ids(&["bob"])));
    let handle = start(&broker, directory.clone());
    let _joined = join(&mut broker, &handle).await;

    let first = tokio::spawn({
        let handle = handle.clone();
        async move { handle.refresh_roster().await }
    });
    let second = tokio::spawn({
        let handle = handle.clone();
        async move { handle.refresh_roster().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(directory.calls(), 1, "initial fetch still in flight");
    directory.release();

    for task in [first, second] {
        let roster = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].identity.id, "bob");
    }
    assert_eq!(directory.calls(), 1);
}

#[tokio::test]
async fn failed_refresh_keeps_last_known_roster() {
    let mut broker = MemoryBroker::new();
    let directory = Arc::new(FakeDirectory::new(vec![Identity::new("bob", "Bob B.")]));
    let handle = start(&broker, directory.clone());
    let _joined = join(&mut broker, &handle).await;

    let roster = handle.refresh_roster().await.unwrap();
    assert_eq!(roster[0].identity.display_name, "Bob B.");

    let mut events = handle.subscribe();
    directory.fail_with(DirectoryFetchError::Status(503));
    assert!(matches!(
        handle.refresh_roster().await,
        Err(SessionError::Directory(DirectoryFetchError::Status(503)))
    ));
    assert_eq!(
        timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap(),
        SessionEvent::DirectoryFetchFailed(DirectoryFetchError::Status(503))
    );
    wait_for_roster(&handle, &["bob"]).await;
}

#[tokio::test]
async fn broker_error_is_surfaced() {
    let mut broker = MemoryBroker::new();
    let handle = start(&broker, Arc::new(FakeDirectory::new(Vec::new())));
    let joined = join(&mut broker, &handle).await;
    let mut events = handle.subscribe();

    joined
        .peer
        .send_frame(Frame::new(Command::Error).header("message", "destination forbidden"));
    let event = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event, SessionEvent::BrokerError("destination forbidden".into()));
}

#[tokio::test]
async fn without_receipts_session_is_active_on_open() {
    let mut broker = MemoryBroker::new();
    let mut config = test_session_config();
    config.await_receipts = false;
    let handle = start_with(config, &broker, Arc::new(FakeDirectory::new(Vec::new())));

    let mut peer = broker.accept().await;
    peer.handshake().await;
    let (public, _private) = acknowledge_subscriptions(&mut peer).await;
    assert_eq!(public.get("receipt"), None);
    wait_for_state(&handle, SessionState::Active).await;
}

#[tokio::test]
async fn missing_receipts_time_out_into_active() {
    let mut broker = MemoryBroker::new();
    let mut config = test_session_config();
    config.receipt_timeout = Duration::from_millis(40);
    let handle = start_with(config, &broker, Arc::new(FakeDirectory::new(Vec::new())));

    let mut peer = broker.accept().await;
    peer.handshake().await;
    acknowledge_subscriptions(&mut peer).await;
    wait_for_state(&handle, SessionState::Active).await;
}

#[tokio::test]
async fn invalid_endpoint_fails_start() {
    let broker = MemoryBroker::new();
    let mut config = test_session_config();
    config.transport.endpoint = "::not an endpoint::".into();
    let result = SessionHandle::start(
        config,
        alice(),
        Credentials::default(),
        broker.connector(),
        Arc::new(FakeDirectory::new(Vec::new())),
    );
    assert!(matches!(result, Err(SessionError::Connect(_))));
}
