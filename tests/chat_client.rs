//! Chat client against a local mock HTTP server (exercises the real curl
//! subprocess path, both streaming and the non-streaming fallback).

use httpmock::prelude::*;
use serde_json::json;

use droid_pilot::llm::{self, LlmConfig, LlmError};

fn config(endpoint: String) -> LlmConfig {
    LlmConfig::new(endpoint)
        .model("test-model")
        .max_tokens(64)
        .activity_timeout(10)
}

#[test]
fn non_streaming_returns_content_and_usage() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{"message": {"content": "{\"thought\":\"t\",\"action\":\"back\",\"action_args\":{}}"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }));
    });

    let cfg = config(server.url("/v1/chat/completions"));
    let reply = llm::complete_non_streaming(&cfg, "what next?", &[]).unwrap();

    mock.assert();
    assert!(reply.text.contains("\"action\":\"back\""));
    assert_eq!(reply.usage.prompt_tokens, 12);
    assert_eq!(reply.usage.total_tokens, 15);
}

#[test]
fn auth_error_body_is_fatal() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_api_key"}
        }));
    });

    let cfg = config(server.url("/v1/chat/completions"));
    let err = llm::complete_non_streaming(&cfg, "hello", &[]).unwrap_err();
    assert!(matches!(err, LlmError::Auth(_)));
    assert!(err.is_fatal());
}

#[test]
fn transient_error_body_is_retryable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "error": {"message": "The server is overloaded", "type": "server_error"}
        }));
    });

    let cfg = config(server.url("/v1/chat/completions"));
    let err = llm::complete_non_streaming(&cfg, "hello", &[]).unwrap_err();
    assert!(matches!(err, LlmError::ConnectionFailed(_)));
    assert!(!err.is_fatal());
}

#[test]
fn streaming_assembles_deltas_and_usage() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"thought\\\":\\\"t\\\",\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"action\\\":\\\"home\\\",\\\"action_args\\\":{}}\"}}]}\n",
        "\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":30,\"completion_tokens\":9,\"total_tokens\":39}}\n",
        "\n",
        "data: [DONE]\n",
        "\n",
    );
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .header("Content-Type", "text/event-stream")
            .body(body);
    });

    let cfg = config(server.url("/v1/chat/completions"));
    let reply = llm::complete(&cfg, "what next?", &[]).unwrap();

    mock.assert();
    assert_eq!(
        reply.text,
        "{\"thought\":\"t\",\"action\":\"home\",\"action_args\":{}}"
    );
    assert_eq!(reply.usage.total_tokens, 39);
}

#[test]
fn streaming_falls_back_when_server_buffers() {
    // A server that answers with a plain completion body even though the
    // request asked for a stream: the client retries non-streaming.
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200).json_body(json!({
            "choices": [{"message": {"content": "plain answer"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }));
    });

    let cfg = config(server.url("/v1/chat/completions"));
    let reply = llm::complete(&cfg, "what next?", &[]).unwrap();

    assert_eq!(mock.hits(), 2);
    assert_eq!(reply.text, "plain answer");
    assert_eq!(reply.usage.total_tokens, 7);
}

#[test]
fn connection_refused_is_a_connection_error() {
    // Nothing listens on this port.
    let cfg = LlmConfig::new("http://127.0.0.1:1/v1/chat/completions")
        .model("test-model")
        .activity_timeout(5);
    let err = llm::complete_non_streaming(&cfg, "hello", &[]).unwrap_err();
    assert!(matches!(err, LlmError::ConnectionFailed(_)));
}
