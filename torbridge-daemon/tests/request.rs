mod common;

use std::time::Duration;

use serde_json::json;
use torbridge_core::{BridgeError, HttpMethod};
use torbridge_daemon::{ProxiedRequest, TorBridge};

use common::{bridge, config_in, MockBackend, MockHttpProxy};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn bridge_behind(proxy: &MockHttpProxy) -> (tempfile::TempDir, TorBridge<MockBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let bridge = TorBridge::new(config_in(&dir, proxy.port), MockBackend::new());
    bridge.start_daemon(TIMEOUT, TIMEOUT).await.unwrap();
    (dir, bridge)
}

#[tokio::test]
async fn json_response_is_parsed_and_kept_raw() {
    let mut proxy = MockHttpProxy::spawn(200, "application/json; charset=utf-8", br#"{"a":1}"#).await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    let result = bridge
        .request(
            ProxiedRequest::new("http://example.onion/items", HttpMethod::Get)
                .header("X-Trace", "abc"),
        )
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.body, br#"{"a":1}"#);
    assert_eq!(result.json, Some(json!({"a": 1})));
    assert_eq!(result.mime_type.as_deref(), Some("application/json"));
    assert_eq!(result.host_payload()["json"], json!({"a": 1}));

    let captured = proxy.requests.recv().await.unwrap();
    assert_eq!(captured.target_host, "example.onion");
    assert_eq!(captured.target_port, 80);
    assert!(captured.head.starts_with("GET /items HTTP/1.1"), "{}", captured.head);
    assert!(captured.head.to_ascii_lowercase().contains("x-trace: abc"));
}

#[tokio::test]
async fn non_2xx_fails_with_status_and_body() {
    let proxy = MockHttpProxy::spawn(404, "text/plain", b"not found").await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    let err = bridge
        .request(ProxiedRequest::new("http://example.onion/", HttpMethod::Get))
        .await
        .unwrap_err();

    match &err {
        BridgeError::RequestError { status, body } => {
            assert_eq!(*status, 404);
            assert_eq!(body, "not found");
        }
        other => panic!("expected RequestError, got {other:?}"),
    }
    assert_eq!(err.code(), "TOR.REQUEST");
}

#[tokio::test]
async fn octet_stream_post_body_is_decoded_on_the_wire() {
    let mut proxy = MockHttpProxy::spawn(201, "text/plain", b"ok").await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    let result = bridge
        .request(
            ProxiedRequest::new("http://example.onion/upload", HttpMethod::Post)
                .header("Content-Type", "application/octet-stream")
                .body("aGVsbG8="),
        )
        .await
        .unwrap();
    assert_eq!(result.status, 201);
    assert!(result.json.is_none());

    let captured = proxy.requests.recv().await.unwrap();
    assert!(captured.head.starts_with("POST /upload"));
    assert_eq!(captured.body, b"hello");
}

#[tokio::test]
async fn get_and_delete_send_no_body() {
    let mut proxy = MockHttpProxy::spawn(200, "text/plain", b"").await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    bridge
        .request(ProxiedRequest::new("http://example.onion/x", HttpMethod::Delete).body("ignored"))
        .await
        .unwrap();

    let captured = proxy.requests.recv().await.unwrap();
    assert!(captured.head.starts_with("DELETE /x"));
    assert!(captured.body.is_empty());
}

#[tokio::test]
async fn malformed_json_degrades_to_absent() {
    let proxy = MockHttpProxy::spawn(200, "application/json", b"{not json").await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    let result = bridge
        .request(ProxiedRequest::new("http://example.onion/", HttpMethod::Get))
        .await
        .unwrap();

    assert!(result.json.is_none());
    assert_eq!(result.body_text(), "{not json");
}

#[tokio::test]
async fn request_requires_running_daemon() {
    let mock = MockBackend::new();
    let (_dir, bridge) = bridge(&mock);

    let err = bridge
        .request(ProxiedRequest::new("http://example.onion/", HttpMethod::Get))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotRunning));
}

#[tokio::test]
async fn unparseable_url_is_rejected() {
    let proxy = MockHttpProxy::spawn(200, "text/plain", b"").await;
    let (_dir, bridge) = bridge_behind(&proxy).await;

    let err = bridge
        .request(ProxiedRequest::new("not a url", HttpMethod::Get))
        .await
        .unwrap_err();
    assert!(matches!(&err, BridgeError::UrlParseError(url) if url == "not a url"));
    assert_eq!(err.code(), "TOR.URL");
}
