use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::broker::Broker;
use crate::broker::clock::system_clock;
use crate::config::{CREATED_QUEUE, OTHER_QUEUE, Settings};
use crate::persistence::Store;
use crate::transport::http::{GatewayBody, handle_request, parse_event, router};
use crate::transport::message::{ADDED_TO_TOPIC, ClientMessage, ServerMessage};
use crate::transport::websocket::{handle_client_message, start_consumer_server};
use crate::utils::error::ValidationError;

fn test_broker() -> Arc<Broker> {
    let store = Store::temporary().unwrap();
    Arc::new(Broker::with_store(store, &Settings::default(), system_clock()).unwrap())
}

fn send_event(body: &str, content_type: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/SendEvent");
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn test_parse_event_accepts_string_and_object() {
    let (body, status) = parse_event(br#"{"message":"hello","status":"created"}"#).unwrap();
    assert_eq!(body, "hello");
    assert_eq!(status, "created");

    let (body, _) = parse_event(br#"{"message":{"id":7},"status":"done"}"#).unwrap();
    assert_eq!(body, r#"{"id":7}"#);
}

#[test]
fn test_parse_event_rejects_malformed_input() {
    assert!(matches!(
        parse_event(b"not json"),
        Err(ValidationError::InvalidJson(_))
    ));
    assert_eq!(parse_event(b"[1,2]"), Err(ValidationError::NotAnObject));
    assert_eq!(
        parse_event(br#"{"status":"created"}"#),
        Err(ValidationError::MissingField("message"))
    );
    assert_eq!(
        parse_event(br#"{"message":"hi"}"#),
        Err(ValidationError::MissingField("status"))
    );
    assert!(matches!(
        parse_event(br#"{"message":"hi","status":""}"#),
        Err(ValidationError::InvalidField { field: "status", .. })
    ));
    assert!(matches!(
        parse_event(br#"{"message":42,"status":"x"}"#),
        Err(ValidationError::InvalidField { field: "message", .. })
    ));
}

#[test]
fn test_handle_request_routes_and_reports() {
    let broker = test_broker();

    let ok = handle_request(&broker, br#"{"message":"hello","status":"created"}"#);
    assert_eq!(ok.status, StatusCode::OK);
    assert!(matches!(ok.body, GatewayBody::Accepted(ref b) if b.message == ADDED_TO_TOPIC));
    assert_eq!(broker.queue(CREATED_QUEUE).unwrap().len(), 1);
    assert_eq!(broker.queue(OTHER_QUEUE).unwrap().len(), 0);

    let bad = handle_request(&broker, br#"{"status":"created"}"#);
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    match bad.body {
        GatewayBody::Error(e) => {
            assert_eq!(e.state, "error");
            assert!(e.message.contains("message"));
        }
        other => panic!("expected error body, got {other:?}"),
    }
    assert_eq!(broker.queue(CREATED_QUEUE).unwrap().len(), 1);
}

#[tokio::test]
async fn test_send_event_accepts_valid_event() {
    let broker = test_broker();
    let response = router(broker.clone())
        .oneshot(send_event(
            r#"{"message":"hello","status":"shipped"}"#,
            Some("application/json"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(json_body(response).await, json!({"message": ADDED_TO_TOPIC}));
    assert_eq!(broker.queue(OTHER_QUEUE).unwrap().len(), 1);
}

#[tokio::test]
async fn test_send_event_without_content_type_is_accepted() {
    let broker = test_broker();
    let response = router(broker)
        .oneshot(send_event(r#"{"message":"hi","status":"created"}"#, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_send_event_missing_message_is_bad_request() {
    let response = router(test_broker())
        .oneshot(send_event(r#"{"status":"created"}"#, Some("application/json")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let body = json_body(response).await;
    assert_eq!(body["state"], "error");
    assert_eq!(body["message"], "missing required field 'message'");
}

#[tokio::test]
async fn test_send_event_bad_json_is_bad_request() {
    let response = router(test_broker())
        .oneshot(send_event("{not json", Some("application/json")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["state"], "error");
}

#[tokio::test]
async fn test_send_event_rejects_other_content_types() {
    let response = router(test_broker())
        .oneshot(send_event(
            r#"{"message":"hi","status":"created"}"#,
            Some("text/plain"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(json_body(response).await["state"], "error");
}

#[tokio::test]
async fn test_health_reports_queue_depths() {
    let broker = test_broker();
    handle_request(&broker, br#"{"message":"a","status":"created"}"#);

    let response = router(broker)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queues"][CREATED_QUEUE], 1);
    assert_eq!(body["queues"][OTHER_QUEUE], 0);
}

#[tokio::test]
async fn test_client_message_receive_and_ack() {
    let broker = test_broker();
    handle_request(&broker, br#"{"message":"a","status":"created"}"#);

    let reply = handle_client_message(
        &broker,
        ClientMessage::Receive {
            queue: CREATED_QUEUE.to_string(),
            max_messages: 5,
            wait_time_ms: 0,
        },
    )
    .await;
    let entries = match reply {
        ServerMessage::Messages { queue, entries } => {
            assert_eq!(queue, CREATED_QUEUE);
            entries
        }
        other => panic!("expected messages, got {other:?}"),
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.body, "a");
    assert_eq!(entries[0].receive_count, 1);

    let ack = ClientMessage::Ack {
        queue: CREATED_QUEUE.to_string(),
        entry_id: entries[0].id.clone(),
    };
    assert_eq!(
        handle_client_message(&broker, ack.clone()).await,
        ServerMessage::AckResult {
            entry_id: entries[0].id.clone(),
            found: true
        }
    );
    assert_eq!(
        handle_client_message(&broker, ack).await,
        ServerMessage::AckResult {
            entry_id: entries[0].id.clone(),
            found: false
        }
    );
}

#[tokio::test]
async fn test_client_message_unknown_queue() {
    let reply = handle_client_message(
        &test_broker(),
        ClientMessage::Receive {
            queue: "nope".to_string(),
            max_messages: 1,
            wait_time_ms: 0,
        },
    )
    .await;
    assert!(matches!(reply, ServerMessage::Error { .. }));
}

#[test]
fn test_receive_request_defaults() {
    let parsed: ClientMessage = serde_json::from_str(r#"{"type":"receive","queue":"q"}"#).unwrap();
    assert_eq!(
        parsed,
        ClientMessage::Receive {
            queue: "q".to_string(),
            max_messages: 1,
            wait_time_ms: 0
        }
    );
}

#[tokio::test]
async fn test_consumer_server_round_trip() {
    let broker = test_broker();
    let shutdown = CancellationToken::new();
    let addr = format!(
        "127.0.0.1:{}",
        portpicker::pick_unused_port().expect("No free ports")
    );
    let server = tokio::spawn(start_consumer_server_owned(
        addr.clone(),
        broker.clone(),
        shutdown.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("WebSocket handshake failed");

    // Long poll first, then publish: the waiting receive must wake up.
    let request = json!({
        "type": "receive",
        "queue": OTHER_QUEUE,
        "max_messages": 10,
        "wait_time_ms": 5000
    });
    ws.send(WsMessage::Text(request.to_string().into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle_request(&broker, br#"{"message":"remote","status":"failed"}"#);

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("reply in time")
        .unwrap()
        .unwrap();
    let reply: ServerMessage = serde_json::from_slice(&reply.into_data()).unwrap();
    let entry = match reply {
        ServerMessage::Messages { mut entries, .. } => entries.remove(0),
        other => panic!("expected messages, got {other:?}"),
    };
    assert_eq!(entry.message.body, "remote");
    assert_eq!(entry.message.attribute("status"), Some("failed"));

    let ack = json!({"type": "ack", "queue": OTHER_QUEUE, "entry_id": entry.id});
    ws.send(WsMessage::Text(ack.to_string().into()))
        .await
        .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let reply: ServerMessage = serde_json::from_slice(&reply.into_data()).unwrap();
    assert_eq!(
        reply,
        ServerMessage::AckResult {
            entry_id: entry.id,
            found: true
        }
    );
    assert!(broker.queue(OTHER_QUEUE).unwrap().is_empty());

    ws.send(WsMessage::Text("{\"type\":\"bogus\"}".into()))
        .await
        .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let reply: ServerMessage = serde_json::from_slice(&reply.into_data()).unwrap();
    assert!(matches!(reply, ServerMessage::Error { .. }));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), server)
        .await
        .expect("server stops on shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_during_long_poll_leaves_entry_unclaimed() {
    let broker = test_broker();
    let shutdown = CancellationToken::new();
    let addr = format!(
        "127.0.0.1:{}",
        portpicker::pick_unused_port().expect("No free ports")
    );
    tokio::spawn(start_consumer_server_owned(
        addr.clone(),
        broker.clone(),
        shutdown.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("WebSocket handshake failed");
    let request = json!({
        "type": "receive",
        "queue": OTHER_QUEUE,
        "max_messages": 10,
        "wait_time_ms": 5000
    });
    ws.send(WsMessage::Text(request.to_string().into()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(ws);
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle_request(&broker, br#"{"message":"orphan","status":"failed"}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let entries = broker.queue(OTHER_QUEUE).unwrap().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].receive_count, 0);
    assert_eq!(entries[0].visible_at, entries[0].enqueued_at);

    shutdown.cancel();
}

async fn start_consumer_server_owned(
    addr: String,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> crate::utils::error::Result<()> {
    start_consumer_server(&addr, broker, shutdown).await
}
