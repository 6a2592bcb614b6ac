//! Ollama inference client
//!
//! Thin adapter over the Ollama `/api/generate` endpoint with two call shapes:
//! - **buffered** (`generate_once`) — single-shot, used for title generation
//!   and document analysis
//! - **token-incremental** (`generate_stream`) — NDJSON line stream of partial
//!   text, terminated by a `done` line that may carry an opaque continuation
//!   `context` blob
//!
//! HTTP-level failures are surfaced distinctly (`ModelNotFound`,
//! `ResourceExhausted`, generic `Api`/`Http`) so the orchestrator can pick the
//! right user-facing message.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OllamaConfig;

/// Events produced by a token-incremental generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateEvent {
    /// One partial-text fragment, forwarded to the client as-is.
    Token(String),
    /// The backend finished; `context` resumes this conversation next turn.
    Done { context: Option<serde_json::Value> },
}

pub type GenerateEventStream = Pin<Box<dyn Stream<Item = Result<GenerateEvent, OllamaError>> + Send>>;

#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model '{model}' not found on the inference backend")]
    ModelNotFound { model: String },

    #[error("Inference backend out of resources: {message}")]
    ResourceExhausted { message: String },

    #[error("Inference backend error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Inference backend reported an error mid-stream: {0}")]
    Interrupted(String),

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// One NDJSON line of a streaming response.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    context: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
}

// ============================================================================
// OllamaClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self, OllamaError> {
        // Only a connect timeout on the shared client: streaming responses are
        // open for as long as generation runs. The total-request timeout is
        // applied per call to the buffered path only.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
        })
    }

    /// Create a client against a custom base URL (for testing / integration).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Buffered single-shot generation.
    pub async fn generate_once(&self, model: &str, prompt: &str) -> Result<String, OllamaError> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            context: None,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;

        let response = check_status(response, model).await?;
        let body: GenerateResponse = response.json().await?;
        Ok(body.response)
    }

    /// Token-incremental generation. The returned stream yields one
    /// [`GenerateEvent::Token`] per partial-text line and ends with a single
    /// [`GenerateEvent::Done`]. Request-level failures (unreachable backend,
    /// missing model) are returned from this call; mid-stream failures become
    /// `Err` items.
    pub async fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<GenerateEventStream, OllamaError> {
        let request = GenerateRequest {
            model,
            prompt,
            stream: true,
            context,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let response = check_status(response, model).await?;
        Ok(parse_ndjson_stream(response))
    }
}

/// Map non-success statuses onto the error taxonomy. Ollama reports a missing
/// model as 404 and puts the human-readable cause under `{"error": ...}`.
async fn check_status(
    response: reqwest::Response,
    model: &str,
) -> Result<reqwest::Response, OllamaError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    tracing::error!(code = status.as_u16(), message = %message, "Ollama API error");

    match status.as_u16() {
        404 => Err(OllamaError::ModelNotFound {
            model: model.to_string(),
        }),
        429 => Err(OllamaError::ResourceExhausted { message }),
        code if code >= 500 && message.to_ascii_lowercase().contains("memory") => {
            Err(OllamaError::ResourceExhausted { message })
        }
        code => Err(OllamaError::Api { code, message }),
    }
}

// ============================================================================
// NDJSON stream parsing
// ============================================================================

struct NdjsonState {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buf: String,
    pending: VecDeque<Result<GenerateEvent, OllamaError>>,
    finished: bool,
}

/// Parse a streaming response body into [`GenerateEvent`]s. Lines are framed
/// on `\n`; a trailing unterminated line is parsed when the body ends. The
/// stream stops after the first `done` line or the first transport error.
fn parse_ndjson_stream(response: reqwest::Response) -> GenerateEventStream {
    let state = NdjsonState {
        bytes: Box::pin(response.bytes_stream()),
        buf: String::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if matches!(event, Ok(GenerateEvent::Done { .. })) {
                    st.finished = true;
                }
                return Some((event, st));
            }

            if st.finished {
                return None;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buf.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = st.buf.find('\n') {
                        let line = st.buf[..pos].trim().to_string();
                        st.buf.drain(..=pos);
                        if !line.is_empty() {
                            st.pending.push_back(parse_line(&line));
                        }
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(OllamaError::Http(e)), st));
                }
                None => {
                    st.finished = true;
                    let line = st.buf.trim().to_string();
                    st.buf.clear();
                    if !line.is_empty() {
                        return Some((parse_line(&line), st));
                    }
                    return None;
                }
            }
        }
    }))
}

fn parse_line(line: &str) -> Result<GenerateEvent, OllamaError> {
    let chunk: GenerateChunk = serde_json::from_str(line)
        .map_err(|e| OllamaError::Malformed(format!("{}: {}", e, line)))?;

    // Ollama can report failures in-band as an error line mid-stream.
    if let Some(error) = chunk.error {
        return Err(OllamaError::Interrupted(error));
    }

    if chunk.done {
        return Ok(GenerateEvent::Done {
            context: chunk.context,
        });
    }

    Ok(GenerateEvent::Token(chunk.response.unwrap_or_default()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut stream: GenerateEventStream) -> Vec<Result<GenerateEvent, OllamaError>> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_generate_once_returns_response_text() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "llama3",
                "prompt": "hola",
                "stream": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama3",
                "response": "Hola, ¿en qué puedo ayudarte?",
                "done": true
            })))
            .mount(&mock_server)
            .await;

        let text = client.generate_once("llama3", "hola").await.unwrap();
        assert_eq!(text, "Hola, ¿en qué puedo ayudarte?");
    }

    #[tokio::test]
    async fn test_generate_once_404_maps_to_model_not_found() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "model 'nope' not found, try pulling it first"
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate_once("nope", "hola").await;
        match result {
            Err(OllamaError::ModelNotFound { model }) => assert_eq!(model, "nope"),
            other => panic!("Expected ModelNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_once_429_maps_to_resource_exhausted() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": "server busy"
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate_once("llama3", "hola").await;
        assert!(
            matches!(result, Err(OllamaError::ResourceExhausted { .. })),
            "429 must map to ResourceExhausted, got {:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_generate_once_500_memory_maps_to_resource_exhausted() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": "model requires more system memory (8.4 GiB) than is available"
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate_once("llama3", "hola").await;
        assert!(
            matches!(result, Err(OllamaError::ResourceExhausted { .. })),
            "OOM 500 must map to ResourceExhausted, got {:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_generate_once_generic_500_maps_to_api_error() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": "something broke"
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate_once("llama3", "hola").await;
        match result {
            Err(OllamaError::Api { code, message }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "something broke");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_stream_yields_tokens_then_done_with_context() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        let ndjson = concat!(
            "{\"response\":\"La \",\"done\":false}\n",
            "{\"response\":\"capital \",\"done\":false}\n",
            "{\"response\":\"es París.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"context\":[1,2,3]}\n",
        );

        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"))
            .mount(&mock_server)
            .await;

        let stream = client
            .generate_stream("llama3", "capital de Francia", None)
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0].as_ref().unwrap(),
            &GenerateEvent::Token("La ".to_string())
        );
        assert_eq!(
            events[2].as_ref().unwrap(),
            &GenerateEvent::Token("es París.".to_string())
        );
        match events[3].as_ref().unwrap() {
            GenerateEvent::Done { context } => {
                assert_eq!(context, &Some(serde_json::json!([1, 2, 3])));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_stream_forwards_continuation_context() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "context": [9, 8, 7]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"ok\",\"done\":false}\n{\"done\":true}\n",
                "application/x-ndjson",
            ))
            .mount(&mock_server)
            .await;

        let context = serde_json::json!([9, 8, 7]);
        let stream = client
            .generate_stream("llama3", "sigue", Some(&context))
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(events.len(), 2, "Mock only matches when context was sent");
    }

    #[tokio::test]
    async fn test_generate_stream_done_without_context() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"hola\",\"done\":false}\n{\"done\":true}\n",
                "application/x-ndjson",
            ))
            .mount(&mock_server)
            .await;

        let stream = client.generate_stream("llama3", "hola", None).await.unwrap();
        let events = collect(stream).await;

        match events.last().unwrap().as_ref().unwrap() {
            GenerateEvent::Done { context } => assert!(context.is_none()),
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_stream_in_band_error_line() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "{\"response\":\"partial\",\"done\":false}\n{\"error\":\"unexpected EOF\"}\n",
                "application/x-ndjson",
            ))
            .mount(&mock_server)
            .await;

        let stream = client.generate_stream("llama3", "hola", None).await.unwrap();
        let events = collect(stream).await;

        assert!(matches!(
            events[0],
            Ok(GenerateEvent::Token(ref t)) if t == "partial"
        ));
        assert!(
            matches!(events[1], Err(OllamaError::Interrupted(ref m)) if m == "unexpected EOF"),
            "In-band error line must surface as Interrupted"
        );
    }

    #[tokio::test]
    async fn test_generate_stream_malformed_line_is_reported() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "this is not json\n{\"done\":true}\n",
                "application/x-ndjson",
            ))
            .mount(&mock_server)
            .await;

        let stream = client.generate_stream("llama3", "hola", None).await.unwrap();
        let events = collect(stream).await;

        assert!(matches!(events[0], Err(OllamaError::Malformed(_))));
        assert!(matches!(events[1], Ok(GenerateEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_generate_stream_404_fails_before_streaming() {
        let mock_server = MockServer::start().await;
        let client = OllamaClient::with_base_url(mock_server.uri());

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "model 'ghost' not found"
            })))
            .mount(&mock_server)
            .await;

        let result = client.generate_stream("ghost", "hola", None).await;
        assert!(matches!(
            result,
            Err(OllamaError::ModelNotFound { ref model }) if model == "ghost"
        ));
    }

    #[test]
    fn test_parse_line_token() {
        let event = parse_line("{\"response\":\"abc\",\"done\":false}").unwrap();
        assert_eq!(event, GenerateEvent::Token("abc".to_string()));
    }

    #[test]
    fn test_parse_line_done_extracts_context() {
        let event = parse_line("{\"response\":\"\",\"done\":true,\"context\":[5]}").unwrap();
        assert_eq!(
            event,
            GenerateEvent::Done {
                context: Some(serde_json::json!([5]))
            }
        );
    }
}
