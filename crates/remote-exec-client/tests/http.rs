//! End-to-end against a mock HTTP server.

mod common;

use common::init_tracing;
use remote_exec_client::{
    Client, ClientConfig, ClientError, Endpoint, ExecutionStatus, TransportConfig,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

fn ndjson(events: &[serde_json::Value]) -> String {
    events.iter().map(|e| format!("{e}\n")).collect()
}

#[tokio::test]
async fn test_send_over_http() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/send"))
        .and(header("authorization", "Bearer secret"))
        .and(body_json(json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "sessionId": "s1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[
            json!({"type": "execution_start", "sessionId": "s1"}),
            json!({"type": "content_delta", "sessionId": "s1", "delta": "yo"}),
            json!({"type": "result", "sessionId": "s1", "result": {"response": "yo"}}),
            json!({"type": "execution_end", "sessionId": "s1"}),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let transport = TransportConfig::new(server.uri())
        .token("secret")
        .endpoint(Endpoint::Send, "/api/send");
    let client = Client::new(transport, ClientConfig::default()).unwrap();

    let handle = client.session("s1").send("hi").await.unwrap();
    assert_eq!(handle.result().await.unwrap().response.as_deref(), Some("yo"));
    assert_eq!(handle.status(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_connect_and_subscribe_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(
                    "data: {\"type\":\"connection\",\"connectionId\":\"c-http\",\"subscriptions\":[]}\n\n",
                ),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/subscribe"))
        .and(body_json(json!({"connectionId": "c-http", "add": ["s1"]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let config = ClientConfig::default().max_reconnect_attempts(0);
    let client = Client::new(TransportConfig::new(server.uri()), config).unwrap();

    client.session("s1").subscribe().await.unwrap();
    assert!(client.session("s1").is_subscribed());
}

#[tokio::test]
async fn test_control_plane_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/close"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such session"))
        .mount(&server)
        .await;

    let client = Client::new(TransportConfig::new(server.uri()), ClientConfig::default()).unwrap();
    let err = client.session("ghost").close().await.unwrap_err();
    assert!(
        matches!(err, ClientError::Http { status: 404, ref body } if body == "no such session")
    );
}
