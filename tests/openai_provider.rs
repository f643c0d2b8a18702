use std::time::Duration;

use dblens::config::{LlmConfig, LlmProviderKind};
use dblens::llm::{AdapterError, AnalysisContext, LlmAdapter};
use dblens::recommendations::SuggestedAction;
use dblens::snapshot::{ColumnStats, DigestEntry, MetricSnapshot, TableStats};
use dblens::{Category, Scope, Severity, Source};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context() -> AnalysisContext {
    let mut snapshot = MetricSnapshot::empty(Scope::schema("shop"));
    snapshot.tables.push(TableStats {
        schema: "shop".into(),
        table: "orders".into(),
        row_estimate: Some(250_000),
        data_bytes: 64 << 20,
        index_bytes: 8 << 20,
    });
    for column in ["id", "user_id", "created_at"] {
        snapshot.columns.push(ColumnStats {
            schema: "shop".into(),
            table: "orders".into(),
            column: column.into(),
            data_type: "bigint".into(),
            nullable: false,
        });
    }
    snapshot.digests.push(DigestEntry {
        digest: "abc123".into(),
        schema: Some("shop".into()),
        text: "SELECT * FROM `orders` WHERE `user_id` = ?".into(),
        exec_count: 400,
        total_latency_ms: 12_000.0,
        avg_latency_ms: 30.0,
        min_latency_ms: 5.0,
        max_latency_ms: 90.0,
        rows_examined: 100_000_000,
        rows_returned: 4_000,
        rows_affected: 0,
        no_index_used: 400,
    });
    AnalysisContext::from_snapshot(&snapshot, 10)
}

fn config(kind: LlmProviderKind, server: &MockServer) -> LlmConfig {
    LlmConfig {
        enabled: true,
        provider: kind,
        model: Some("gpt-4o-mini".into()),
        base_url: Some(server.uri()),
        api_key: Some("sk-test".into()),
        timeout: Duration::from_secs(5),
        ..LlmConfig::default()
    }
}

fn adapter(config: &LlmConfig) -> LlmAdapter {
    LlmAdapter::from_config(config)
        .expect("provider builds")
        .expect("enabled")
}

fn chat_completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

#[tokio::test]
async fn parses_fenced_answer_after_reasoning_block() {
    let server = MockServer::start().await;
    let content = "<think>user_id is the only filter</think>\n```json\n{\"recommendations\":[{\"category\":\"missing_index\",\"target\":{\"schema\":\"shop\",\"table\":\"orders\",\"columns\":[\"user_id\"]},\"rationale\":\"Filters scan the table.\",\"confidence\":0.8,\"severity\":\"high\",\"suggested_action\":\"CREATE INDEX idx_orders_user ON shop.orders (user_id)\",\"digests\":[\"abc123\"]}]}\n```";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(content)))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter(&config(LlmProviderKind::OpenAi, &server));
    assert_eq!(adapter.provider_name(), "openai");
    let recs = adapter.analyze(&context()).await.expect("valid answer");

    assert_eq!(recs.len(), 1);
    let rec = &recs[0];
    assert_eq!(rec.category, Category::MissingIndex);
    assert_eq!(rec.severity, Severity::High);
    assert_eq!(rec.source, Source::Llm);
    assert_eq!(rec.target.columns, vec!["user_id"]);
    assert_eq!(rec.digests, vec!["abc123"]);
    assert!(matches!(rec.suggested_action, Some(SuggestedAction::Sql(_))));
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = adapter(&config(LlmProviderKind::OpenAiCompatible, &server))
        .analyze(&context())
        .await
        .expect_err("503 must fail");
    assert!(matches!(err, AdapterError::Unavailable(ref msg) if msg.contains("503")));
}

#[tokio::test]
async fn client_error_is_a_backend_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = adapter(&config(LlmProviderKind::DeepSeek, &server))
        .analyze(&context())
        .await
        .expect_err("401 must fail");
    assert!(matches!(err, AdapterError::Backend(_)));
}

#[tokio::test]
async fn non_json_body_is_an_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = adapter(&config(LlmProviderKind::OpenAi, &server))
        .analyze(&context())
        .await
        .expect_err("html must fail");
    assert!(matches!(err, AdapterError::InvalidResponse(_)));
}

#[tokio::test]
async fn answer_outside_the_schema_is_rejected_whole() {
    let server = MockServer::start().await;
    let content = r#"{"recommendations":[{"category":"missing_index","target":{"table":"orders","columns":["user_id"]},"rationale":"x","confidence":7}]}"#;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion(content)))
        .mount(&server)
        .await;

    let err = adapter(&config(LlmProviderKind::OpenAi, &server))
        .analyze(&context())
        .await
        .expect_err("confidence 7 is out of range");
    assert!(matches!(err, AdapterError::InvalidResponse(_)));
}

#[tokio::test]
async fn ollama_generate_endpoint() {
    let server = MockServer::start().await;
    let answer = r#"{"recommendations":[{"category":"missing_index","target":{"table":"orders","columns":["user_id"]},"rationale":"Hot filter.","confidence":0.6}]}"#;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "stream": false, "format": "json" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.1",
            "response": answer,
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(LlmProviderKind::Ollama, &server);
    config.model = Some("llama3.1".into());
    config.api_key = None;
    let recs = adapter(&config).analyze(&context()).await.unwrap();

    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].severity, Severity::Medium);
    assert_eq!(recs[0].target.schema, "shop");
}
