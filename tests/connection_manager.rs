//! ConnectionManager against the in-memory gateway
//!
//! All tests run on tokio's paused clock, so backoff, heartbeat and timeout
//! delays elapse instantly once every task is idle.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::{accept, connect, harness, spawn_echo, test_config, wait_for_state};
use voxbridge::connection::TransportError;
use voxbridge::resilience::CircuitState;
use voxbridge::{ConnectionError, ConnectionState, Envelope, ErrorCategory, SendOptions};

#[tokio::test(start_paused = true)]
async fn test_connect_waits_for_first_pong() {
    let mut h = harness(test_config());
    let manager = h.manager.clone();
    let connecting = tokio::spawn(async move { manager.connect().await });

    let mut server = h.links.recv().await.unwrap();
    let ping = server.recv().await.unwrap();
    assert_eq!(ping["action"], "ping");
    assert!(ping["data"]["timestamp"].is_i64());

    // Transport open is not enough
    assert_eq!(h.manager.state(), ConnectionState::Connecting);

    server.pong().await;
    connecting.await.unwrap().unwrap();
    assert_eq!(h.manager.state(), ConnectionState::Connected);

    // Already connected: resolves without opening another link
    h.manager.connect().await.unwrap();
    assert_eq!(h.transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_ready_pong_counts_as_failed_attempt() {
    let mut h = harness(test_config());
    let manager = h.manager.clone();
    let connecting = tokio::spawn(async move { manager.connect().await });

    // First link never answers its ping
    let mut silent = h.links.recv().await.unwrap();
    assert_eq!(silent.recv().await.unwrap()["action"], "ping");

    // Readiness deadline passes, the retry gets a pong
    let _server = accept(&mut h.links).await;
    connecting.await.unwrap().unwrap();

    assert_eq!(h.transport.opened(), 2);
    assert_eq!(h.manager.stats().await.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flush_in_order_on_connect() {
    let mut h = harness(test_config());

    for action in ["first", "second", "third"] {
        h.manager.send(Envelope::new(action)).await.unwrap();
    }
    assert_eq!(h.manager.stats().await.queued_messages, 3);

    let mut server = connect(&mut h).await;
    for expected in ["first", "second", "third"] {
        assert_eq!(server.recv_message().await.unwrap()["action"], expected);
    }

    let stats = h.manager.stats().await;
    assert_eq!(stats.queued_messages, 0);
    assert_eq!(stats.messages_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn test_request_resolves_with_matching_response() {
    let mut h = harness(test_config());
    let server = connect(&mut h).await;
    let gateway = spawn_echo(server);

    let response = h
        .manager
        .request(
            Envelope::new("translate")
                .with_session("s-1")
                .with_field("text", "hola"),
            SendOptions::correlated(),
        )
        .await
        .unwrap();

    assert!(response.success);
    assert_eq!(response.action, "translate");
    assert_eq!(response.into_result().unwrap()["text"], "hola");
    assert_eq!(h.manager.stats().await.pending_requests, 0);

    h.manager.dispose().await;
    let received = gateway.await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["sessionId"], "s-1");
    assert!(received[0]["requestId"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_send_with_dispatches_on_correlation() {
    let mut h = harness(test_config());
    let server = connect(&mut h).await;
    let _gateway = spawn_echo(server);

    let plain = h
        .manager
        .send_with(Envelope::new("note"), SendOptions::default())
        .await
        .unwrap();
    assert!(plain.is_none());

    let correlated = h
        .manager
        .send_with(Envelope::new("translate"), SendOptions::correlated())
        .await
        .unwrap();
    assert!(correlated.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_response() {
    let mut h = harness(test_config());
    let mut server = connect(&mut h).await;

    let manager = h.manager.clone();
    let request = tokio::spawn(async move {
        manager
            .request(Envelope::new("translate"), SendOptions::correlated())
            .await
    });

    let frame = server.recv_message().await.unwrap();
    server
        .push(json!({
            "success": false,
            "action": "translate",
            "error": "rate limit exceeded",
            "requestId": frame["requestId"],
        }))
        .await;

    let response = request.await.unwrap().unwrap();
    let err = response.into_result().unwrap_err();
    assert!(matches!(err, ConnectionError::Remote { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_exactly_once() {
    let mut h = harness(test_config());
    let mut server = connect(&mut h).await;

    let started = Instant::now();
    let err = h
        .manager
        .request(
            Envelope::new("translate"),
            SendOptions::correlated().with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    match err {
        ConnectionError::Timeout { after, .. } => assert_eq!(after, Duration::from_millis(200)),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(h.manager.stats().await.pending_requests, 0);

    // A late response is ignored
    let frame = server.recv_message().await.unwrap();
    server.respond(&frame, json!({})).await;
    assert_eq!(h.manager.stats().await.pending_requests, 0);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_request_uses_default_message_timeout() {
    let mut h = harness(test_config());
    let _server = connect(&mut h).await;

    let started = Instant::now();
    let err = h
        .manager
        .request(Envelope::new("translate"), SendOptions::correlated())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_in_flight_and_keeps_queue() {
    let mut h = harness(test_config());
    let mut server = connect(&mut h).await;

    let manager = h.manager.clone();
    let in_flight = tokio::spawn(async move {
        manager
            .request(Envelope::new("translate"), SendOptions::correlated())
            .await
    });
    assert_eq!(server.recv_message().await.unwrap()["action"], "translate");

    server.close("gateway restarting").await;
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::Disconnected(_)), "{:?}", err);

    wait_for_state(&h.manager, ConnectionState::Reconnecting).await;
    h.manager.send(Envelope::new("later")).await.unwrap();

    let mut server = accept(&mut h.links).await;
    wait_for_state(&h.manager, ConnectionState::Connected).await;
    assert_eq!(server.recv_message().await.unwrap()["action"], "later");

    assert_eq!(h.transport.opened(), 2);
    assert_eq!(h.manager.stats().await.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_heartbeat_triggers_reconnect() {
    let mut h = harness(test_config());
    // Keep the link open but never read from it again
    let _server = connect(&mut h).await;

    wait_for_state(&h.manager, ConnectionState::Reconnecting).await;

    let history = h.context.errors().logger().history();
    assert_eq!(history[0].code, "HEARTBEAT_TIMEOUT");
    assert_eq!(history[0].category, "TIMEOUT");

    let _server = accept(&mut h.links).await;
    wait_for_state(&h.manager, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_enters_error_state() {
    let mut h = harness(test_config());
    let mut surfaced = h.context.errors().subscribe();
    h.transport.refuse_all(true);

    let started = Instant::now();
    let err = h.manager.connect().await.unwrap_err();

    match &err {
        ConnectionError::Unavailable(e) => {
            assert_eq!(e.code(), "RECONNECT_EXHAUSTED");
            assert_eq!(e.category(), ErrorCategory::ServiceUnavailable);
            assert!(!e.recovery_actions().is_empty());
        }
        other => panic!("expected unavailable, got {:?}", other),
    }
    assert_eq!(h.manager.state(), ConnectionState::Error);

    // One initial attempt plus three retries after 100, 200 and 400ms
    assert_eq!(h.transport.opened(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "{:?}", elapsed);

    assert_eq!(surfaced.recv().await.unwrap().code(), "RECONNECT_EXHAUSTED");

    // Backoff paces reconnects; the gateway breaker is not involved
    assert_eq!(
        h.context.errors().breakers().state("realtime-gateway"),
        CircuitState::Closed
    );

    let send = h.manager.send(Envelope::new("translate")).await;
    assert!(matches!(send, Err(ConnectionError::Unavailable(_))));

    // A new connect starts over
    h.transport.refuse_all(false);
    let _server = connect(&mut h).await;
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transient_open_failures_recover() {
    let mut h = harness(test_config());
    h.transport
        .fail_next(TransportError::ConnectTimeout(Duration::from_millis(500)));
    h.transport.fail_next(TransportError::Rejected { status: 503 });

    let _server = connect(&mut h).await;
    assert_eq!(h.transport.opened(), 3);

    let health = h.context.errors().health().health("realtime-gateway");
    assert!(health.is_healthy);
    assert_eq!(health.consecutive_errors, 0);
    assert_eq!(health.error_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_are_not_retried() {
    let h = harness(test_config());
    let mut surfaced = h.context.errors().subscribe();
    h.transport.fail_next(TransportError::Rejected { status: 401 });

    let err = h.manager.connect().await.unwrap_err();
    match &err {
        ConnectionError::Unavailable(e) => {
            assert_eq!(e.category(), ErrorCategory::Authentication);
            assert!(!e.recovery_actions().is_empty());
        }
        other => panic!("expected unavailable, got {:?}", other),
    }
    assert_eq!(h.manager.state(), ConnectionState::Error);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.transport.opened(), 1);

    // Surfaced once, as itself
    let error = surfaced.try_recv().unwrap();
    assert_eq!(error.category(), ErrorCategory::Authentication);
    assert!(surfaced.try_recv().is_err());

    let send = h.manager.send(Envelope::new("translate")).await;
    assert!(matches!(send, Err(ConnectionError::Unavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_url_fails_on_first_attempt() {
    let mut h = harness(test_config());
    let mut surfaced = h.context.errors().subscribe();
    h.transport.fail_next(TransportError::InvalidUrl("bad".to_string()));

    let started = Instant::now();
    let err = h.manager.connect().await.unwrap_err();
    match &err {
        ConnectionError::Unavailable(e) => {
            assert_eq!(e.code(), "VALIDATION");
            assert_eq!(e.category(), ErrorCategory::Validation);
            assert!(e.raw_message().contains("invalid endpoint URL"));
        }
        other => panic!("expected unavailable, got {:?}", other),
    }
    // No backoff delay was taken
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(h.transport.opened(), 1);
    assert_eq!(surfaced.try_recv().unwrap().code(), "VALIDATION");

    // Fixed endpoint, fresh connect
    let _server = connect(&mut h).await;
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_rejects_pending_requests() {
    let mut h = harness(test_config());
    let mut server = connect(&mut h).await;

    let mut requests = Vec::new();
    for _ in 0..2 {
        let manager = h.manager.clone();
        requests.push(tokio::spawn(async move {
            manager
                .request(Envelope::new("translate"), SendOptions::correlated())
                .await
        }));
    }
    server.recv_message().await.unwrap();
    server.recv_message().await.unwrap();
    assert_eq!(h.manager.stats().await.pending_requests, 2);

    h.manager.dispose().await;

    for request in requests {
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled), "{:?}", err);
    }
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.manager.stats().await.pending_requests, 0);

    let after = h.manager.send(Envelope::new("translate")).await;
    assert!(matches!(after, Err(ConnectionError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_queued_requests() {
    let h = harness(test_config());

    let manager = h.manager.clone();
    let queued = tokio::spawn(async move {
        manager
            .request(
                Envelope::new("translate"),
                SendOptions::correlated().with_timeout(Duration::from_secs(60)),
            )
            .await
    });
    while h.manager.stats().await.pending_requests == 0 {
        tokio::task::yield_now().await;
    }

    h.manager.disconnect().await;
    assert!(matches!(
        queued.await.unwrap(),
        Err(ConnectionError::Cancelled)
    ));
    assert_eq!(h.manager.stats().await.queued_messages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_connect_again() {
    let mut h = harness(test_config());
    let _server = connect(&mut h).await;

    h.manager.disconnect().await;
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);

    let _server = connect(&mut h).await;
    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert_eq!(h.transport.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow_drops_oldest() {
    let h = harness(test_config());

    let manager = h.manager.clone();
    let oldest = tokio::spawn(async move {
        manager
            .request(Envelope::new("translate"), SendOptions::correlated())
            .await
    });
    while h.manager.stats().await.pending_requests == 0 {
        tokio::task::yield_now().await;
    }

    // Queue holds five; the fifth send evicts the request
    for n in 0..5 {
        h.manager
            .send(Envelope::new("note").with_field("n", n))
            .await
            .unwrap();
    }

    match oldest.await.unwrap() {
        Err(ConnectionError::QueueOverflow { action }) => assert_eq!(action, "translate"),
        other => panic!("expected overflow, got {:?}", other),
    }

    let stats = h.manager.stats().await;
    assert_eq!(stats.queued_messages, 5);
    assert_eq!(stats.messages_dropped, 1);
    assert_eq!(stats.pending_requests, 0);

    // Overflow is logged but does not count against the gateway's health
    let history = h.context.errors().logger().history();
    assert_eq!(history[0].code, "QUEUE_OVERFLOW");
    assert!(h.context.errors().health().is_healthy("realtime-gateway"));
}

#[tokio::test(start_paused = true)]
async fn test_event_listeners_run_in_registration_order() {
    let mut h = harness(test_config());
    let server = connect(&mut h).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let first_tx = tx.clone();
    let first = h.manager.add_event_listener("translation", move |envelope| {
        let _ = first_tx.send(("first", envelope.data["text"].clone()));
    });
    let second_tx = tx.clone();
    h.manager.add_event_listener("translation", move |envelope| {
        let _ = second_tx.send(("second", envelope.data["text"].clone()));
    });

    server
        .push_event("translation", json!({"text": "hello"}))
        .await;
    assert_eq!(rx.recv().await.unwrap(), ("first", json!("hello")));
    assert_eq!(rx.recv().await.unwrap(), ("second", json!("hello")));

    assert!(h.manager.remove_event_listener(first));
    server.push_event("translation", json!({"text": "again"})).await;
    assert_eq!(rx.recv().await.unwrap(), ("second", json!("again")));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_listener_does_not_break_dispatch() {
    let mut h = harness(test_config());
    let server = connect(&mut h).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    h.manager
        .add_event_listener("transcript", |_| panic!("listener bug"));
    h.manager.add_event_listener("transcript", move |_| {
        let _ = tx.send(());
    });

    server.push_event("transcript", json!({})).await;
    rx.recv().await.unwrap();
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_frame_surfaced_as_validation() {
    let mut h = harness(test_config());
    let errors = Arc::clone(h.context.errors());
    let mut surfaced = errors.subscribe();
    let server = connect(&mut h).await;

    server.push_raw("{not json").await;
    let error = surfaced.recv().await.unwrap();
    assert_eq!(error.code(), "INVALID_FRAME");
    assert_eq!(error.category(), ErrorCategory::Validation);

    // An event without its data object fails closed too
    server.push(json!({"action": "translation"})).await;
    assert_eq!(surfaced.recv().await.unwrap().code(), "INVALID_FRAME");

    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_status_transitions_are_observable() {
    let mut h = harness(test_config());
    let mut status = h.manager.subscribe_status();
    assert_eq!(*status.borrow(), ConnectionState::Disconnected);

    let server = connect(&mut h).await;
    assert_eq!(*status.borrow_and_update(), ConnectionState::Connected);

    server.close("bye").await;
    status.changed().await.unwrap();
    assert_eq!(*status.borrow_and_update(), ConnectionState::Reconnecting);
}
