use super::*;
use crate::client::test_helpers::FakeTransport;

// =============================================================================
// build
// =============================================================================

#[test]
fn build_sets_default_user_agent_and_content_type() {
    let request = RequestBuilder::new(Method::Get, "https://example.test/a").build();

    assert_eq!(request.header("user-agent"), Some(DEFAULT_USER_AGENT));
    assert_eq!(request.header(HEADER_CONTENT_TYPE), Some("application/x-www-form-urlencoded"));
}

#[test]
fn caller_headers_override_defaults_case_insensitively() {
    let request = RequestBuilder::new(Method::Get, "https://example.test/a")
        .header("content-type", "application/json")
        .header("X-Custom", "one")
        .header("x-custom", "two")
        .build();

    assert_eq!(request.header(HEADER_CONTENT_TYPE), Some("application/json"));
    assert_eq!(request.header("X-CUSTOM"), Some("two"));
    let custom = request
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("x-custom"))
        .count();
    assert_eq!(custom, 1);
}

#[test]
fn post_sends_form_data_with_content_length() {
    let request = RequestBuilder::new(Method::Post, "https://example.test/a")
        .form_param("a", "1")
        .form_param_encoded("msg", "hello world&more")
        .build();

    let body = request.body.clone().unwrap();
    assert_eq!(String::from_utf8(body).unwrap(), "a=1&msg=hello%20world%26more");
    assert_eq!(request.header(HEADER_CONTENT_LENGTH), Some("28"));
}

#[test]
fn put_prefers_raw_body_over_form_data() {
    let request = RequestBuilder::new(Method::Put, "https://example.test/a")
        .form_param("ignored", "x")
        .body(vec![1_u8, 2, 3])
        .build();

    assert_eq!(request.body.as_deref(), Some(&[1_u8, 2, 3][..]));
    assert_eq!(request.header(HEADER_CONTENT_LENGTH), Some("3"));
}

#[test]
fn post_without_data_sends_empty_body() {
    let request = RequestBuilder::new(Method::Post, "https://example.test/a").build();

    assert_eq!(request.body.as_deref(), Some(&[][..]));
    assert_eq!(request.header(HEADER_CONTENT_LENGTH), Some("0"));
}

#[test]
fn get_and_delete_never_carry_a_body() {
    for method in [Method::Get, Method::Delete] {
        let request = RequestBuilder::new(method, "https://example.test/a")
            .form_param("a", "1")
            .body(b"raw".to_vec())
            .build();
        assert!(request.body.is_none(), "{method} carried a body");
        assert!(request.header(HEADER_CONTENT_LENGTH).is_none());
    }
}

#[test]
fn location_prefix_fills_placeholder() {
    let builder = RequestBuilder::new(Method::Get, "https://{prefix}client-s.example.test/v1").location_prefix("bs1-");
    assert_eq!(builder.url(), "https://bs1-client-s.example.test/v1");
}

#[test]
fn set_form_data_replaces_existing_fields() {
    let builder = RequestBuilder::new(Method::Post, "https://example.test/a")
        .form_param("a", "1")
        .set_form_data("b=2");
    assert_eq!(builder.form_data(), "b=2");
}

#[test]
fn body_reader_drains_the_stream() {
    let builder = RequestBuilder::new(Method::Put, "https://example.test/a")
        .body_reader(std::io::Cursor::new(b"image-bytes".to_vec()))
        .unwrap();
    assert_eq!(builder.build().body.as_deref(), Some(&b"image-bytes"[..]));
}

// =============================================================================
// send
// =============================================================================

#[tokio::test]
async fn send_returns_body_on_success() {
    let transport = FakeTransport::ok(r#"{"ok":true}"#);

    let body = RequestBuilder::new(Method::Get, "https://example.test/a")
        .send(&transport)
        .await
        .unwrap();

    assert_eq!(body, r#"{"ok":true}"#);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn send_maps_non_success_to_request_failed_with_body() {
    let transport = FakeTransport::status(500, "server exploded");

    let err = RequestBuilder::new(Method::Get, "https://example.test/a")
        .send(&transport)
        .await
        .unwrap_err();

    match err {
        ClientError::RequestFailed { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "server exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unreadable_error_body_becomes_empty() {
    let transport = FakeTransport::new(|_| Ok(HttpResponse { status: 404, body: None }));

    let err = RequestBuilder::new(Method::Get, "https://example.test/a")
        .log_failures(false)
        .send(&transport)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::RequestFailed { status: 404, ref body } if body.is_empty()));
}

#[tokio::test]
async fn unreadable_success_body_is_transport_error() {
    let transport = FakeTransport::new(|_| Ok(HttpResponse { status: 200, body: None }));

    let err = RequestBuilder::new(Method::Get, "https://example.test/a")
        .send(&transport)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
}

#[tokio::test]
async fn send_json_rejects_non_json_body() {
    let transport = FakeTransport::ok("<html>not json</html>");

    let err = RequestBuilder::new(Method::Get, "https://example.test/a")
        .send_json(&transport)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::MalformedResponse(_)));
}

#[tokio::test]
async fn send_passes_timeout_to_transport() {
    let transport = FakeTransport::ok("{}");

    RequestBuilder::new(Method::Get, "https://example.test/a")
        .timeout(Some(Duration::from_secs(3)))
        .send(&transport)
        .await
        .unwrap();

    assert_eq!(transport.last_request().unwrap().timeout, Some(Duration::from_secs(3)));
}

// =============================================================================
// ReqwestTransport
// =============================================================================

mod reqwest_transport {
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn sends_headers_and_form_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads"))
            .and(header("X-Skypetoken", "tok"))
            .and(header("Content-Type", "application/x-www-form-urlencoded"))
            .and(body_string("topic=Team%20A"))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"id":"19:abc"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&ClientConfig::default()).unwrap();
        let value = RequestBuilder::new(Method::Post, format!("{}/v1/threads", server.uri()))
            .header("X-Skypetoken", "tok")
            .form_param_encoded("topic", "Team A")
            .send_json(&transport)
            .await
            .unwrap();

        assert_eq!(value["id"], "19:abc");
    }

    #[tokio::test]
    async fn reports_error_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/members/8:bob"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(&ClientConfig::default()).unwrap();
        let err = RequestBuilder::new(Method::Delete, format!("{}/v1/members/8:bob", server.uri()))
            .send(&transport)
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(403));
        assert!(matches!(err, ClientError::RequestFailed { ref body, .. } if body == "forbidden"));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let transport = ReqwestTransport::new(&ClientConfig::default()).unwrap();

        let err = RequestBuilder::new(Method::Get, "http://127.0.0.1:1/unreachable")
            .send(&transport)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[test]
    fn invalid_proxy_is_config_error() {
        let config = ClientConfig::default().with_proxy("http://exa mple.test");
        assert!(matches!(ReqwestTransport::new(&config), Err(ClientError::Config(_))));
    }
}
