use super::*;
use serde_json::json;
use serial_test::serial;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> ServiceConfig {
    ServiceConfig {
        base_url: format!("{}/v1", server.uri()),
        embedding_dimension: 3,
        ..ServiceConfig::default()
    }
}

fn client(server: &MockServer) -> OpenAiClient {
    OpenAiClient::with_api_key(&config(server), "test-key")
        .expect("client")
        .with_backoff(Duration::from_millis(5))
}

/// Serves one line per read and counts how many lines were pulled
struct LineByLine {
    lines: Vec<String>,
    reads: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl std::io::Read for LineByLine {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let index = self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let Some(line) = self.lines.get(index) else {
            return Ok(0);
        };
        let bytes = line.as_bytes();
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }
}

fn token_line(token: &str) -> String {
    format!("data: {}\n", json!({ "choices": [{ "delta": { "content": token } }] }))
}

#[test]
fn forwards_tokens_until_done() {
    let (tx, mut rx) = mpsc::channel(8);
    let body = format!("{}: keep-alive\n\n{}data: [DONE]\n{}", token_line("A"), token_line("B"), token_line("C"));

    let forwarded = forward_stream_lines(body.as_bytes(), &tx).expect("forward");

    assert_eq!(forwarded, 2);
    drop(tx);
    let mut received = Vec::new();
    while let Ok(item) = rx.try_recv() {
        received.push(item.expect("token"));
    }
    assert_eq!(received, vec!["A".to_string(), "B".to_string()]);
}

#[test]
fn dropped_consumer_stops_reading_during_keep_alives() {
    let reads = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut lines: Vec<String> = (0..100).map(|_| ": keep-alive\n".to_string()).collect();
    lines.push(token_line("late"));
    let reader = std::io::BufReader::new(LineByLine {
        lines,
        reads: std::sync::Arc::clone(&reads),
    });
    let (tx, rx) = mpsc::channel(8);
    drop(rx);

    let forwarded = forward_stream_lines(reader, &tx).expect("forward");

    assert_eq!(forwarded, 0);
    assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn parses_stream_lines() {
    assert_eq!(
        parse_stream_line(r#"data: {"choices":[{"delta":{"content":"ATP"}}]}"#).expect("token"),
        StreamLine::Token("ATP".to_string())
    );
    assert_eq!(parse_stream_line("data: [DONE]").expect("done"), StreamLine::Done);
    assert_eq!(parse_stream_line("").expect("blank"), StreamLine::Skip);
    assert_eq!(parse_stream_line(": keep-alive").expect("comment"), StreamLine::Skip);
    assert_eq!(
        parse_stream_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
            .expect("role only"),
        StreamLine::Skip
    );
    assert!(matches!(
        parse_stream_line("data: {not json"),
        Err(StudyError::GenerationService(_))
    ));
    assert!(matches!(
        parse_stream_line(r#"data: {"error":{"message":"overloaded"}}"#),
        Err(StudyError::GenerationService(_))
    ));
}

#[test]
fn base_url_keeps_version_prefix() {
    let config = ServiceConfig {
        base_url: "http://localhost:8080/v1".to_string(),
        ..ServiceConfig::default()
    };
    let client = OpenAiClient::with_api_key(&config, "key").expect("client");
    assert_eq!(
        client.endpoint("embeddings").expect("url").as_str(),
        "http://localhost:8080/v1/embeddings"
    );
}

#[test]
fn empty_api_key_is_a_config_error() {
    let result = OpenAiClient::with_api_key(&ServiceConfig::default(), "  ");
    assert!(matches!(result, Err(StudyError::Config(_))));
}

#[test]
#[serial]
fn api_key_comes_from_the_environment() {
    let config = ServiceConfig {
        api_key_env: "MEDBOT_TEST_API_KEY".to_string(),
        ..ServiceConfig::default()
    };

    unsafe { std::env::remove_var("MEDBOT_TEST_API_KEY") };
    assert!(matches!(OpenAiClient::new(&config), Err(StudyError::Config(_))));

    unsafe { std::env::set_var("MEDBOT_TEST_API_KEY", "from-env") };
    let client = OpenAiClient::new(&config).expect("client");
    assert_eq!(client.api_key, "from-env");
    unsafe { std::env::remove_var("MEDBOT_TEST_API_KEY") };
}

#[tokio::test]
async fn embeds_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "input": "cellular respiration" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [0.1, 0.2, 0.3], "index": 0 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let vector = client(&server)
        .embed("cellular respiration")
        .await
        .expect("embedding");

    assert_eq!(vector, vec![0.1, 0.2, 0.3]);
}

#[tokio::test]
async fn wrong_embedding_length_is_a_service_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "embedding": [0.1, 0.2] }]
        })))
        .mount(&server)
        .await;

    let result = client(&server).embed("text").await;
    assert!(matches!(result, Err(StudyError::EmbeddingService(_))));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let result = client(&server).with_retry_attempts(3).embed("text").await;
    assert!(matches!(result, Err(StudyError::EmbeddingService(_))));
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .with_retry_attempts(3)
        .complete(&[ChatMessage::user("hi")], &CompletionOptions::default())
        .await;
    assert!(matches!(result, Err(StudyError::GenerationService(_))));
}

#[tokio::test]
async fn completes_chat() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "messages": [{ "role": "user", "content": "What is ATP?" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "The energy currency of the cell." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server)
        .complete(&[ChatMessage::user("What is ATP?")], &CompletionOptions::default())
        .await
        .expect("completion");

    assert_eq!(reply, "The energy currency of the cell.");
}

#[tokio::test]
async fn streams_tokens_in_order() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Question\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" 1:\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let tokens: Vec<String> = client(&server)
        .stream(&[ChatMessage::user("exam")], &CompletionOptions::default())
        .await
        .expect("stream")
        .map(|t| t.expect("token"))
        .collect()
        .await;

    assert_eq!(tokens, vec!["Question".to_string(), " 1:".to_string()]);
}

#[tokio::test]
async fn failed_stream_yields_an_error_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let items: Vec<Result<String>> = client(&server)
        .stream(&[ChatMessage::user("exam")], &CompletionOptions::default())
        .await
        .expect("stream")
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(StudyError::GenerationService(_))));
}

#[tokio::test]
async fn health_check_reaches_models_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    tokio::task::spawn_blocking(move || client.health_check())
        .await
        .expect("task")
        .expect("healthy");
}
