#[cfg(test)]
mod tests;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::EmbeddingService;
use crate::config::ServiceConfig;
use crate::generation::{ChatMessage, CompletionOptions, CompletionService, TokenStream};
use crate::{Result, StudyError};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const STREAM_CHANNEL_CAPACITY: usize = 32;
/// A streamed body may take this many request timeouts to finish
const STREAM_BODY_TIMEOUT_FACTOR: u32 = 10;

/// Forward the tokens of a provider event stream into `tx`, returning how
/// many were sent. Reading stops as soon as the receiver is dropped, checked
/// before every line so keep-alive traffic also notices a disconnect.
fn forward_stream_lines<R: BufRead>(reader: R, tx: &mpsc::Sender<Result<String>>) -> Result<usize> {
    let mut forwarded = 0usize;
    for line in reader.lines() {
        if tx.is_closed() {
            info!("Stream consumer went away after {} tokens", forwarded);
            return Ok(forwarded);
        }
        let line =
            line.map_err(|e| StudyError::GenerationService(format!("stream interrupted: {e}")))?;
        match parse_stream_line(&line)? {
            StreamLine::Token(token) => {
                if tx.blocking_send(Ok(token)).is_err() {
                    info!("Stream consumer went away after {} tokens", forwarded);
                    return Ok(forwarded);
                }
                forwarded += 1;
            }
            StreamLine::Done => break,
            StreamLine::Skip => {}
        }
    }
    Ok(forwarded)
}

/// Client for an OpenAI-compatible embeddings and chat completions API
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: Url,
    api_key: String,
    embedding_model: String,
    embedding_dimension: usize,
    chat_model: String,
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
    retry_attempts: u32,
    backoff: Duration,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// One line of a server-sent completion stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Token(String),
    Done,
    Skip,
}

/// Interpret one line of the provider's event stream
pub fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    if payload.is_empty() {
        return Ok(StreamLine::Skip);
    }

    let chunk: ChatChunk = serde_json::from_str(payload).map_err(|e| {
        StudyError::GenerationService(format!("malformed stream event: {e}"))
    })?;
    if let Some(error) = chunk.error {
        return Err(StudyError::GenerationService(format!(
            "provider reported an error: {error}"
        )));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(StreamLine::Skip, StreamLine::Token))
}

impl OpenAiClient {
    /// Build a client, reading the API key from the configured variable
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            StudyError::Config(format!(
                "environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ServiceConfig, api_key: impl Into<String>) -> Result<Self> {
        let base_url = config
            .service_url()
            .map_err(|e| StudyError::Config(e.to_string()))?;
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(StudyError::Config("API key is empty".to_string()));
        }

        Ok(Self {
            base_url,
            api_key,
            embedding_model: config.embedding_model.clone(),
            embedding_dimension: config.embedding_dimension as usize,
            chat_model: config.chat_model.clone(),
            agent: Self::request_agent(config.timeout()),
            stream_agent: Self::stream_agent(config.timeout()),
            retry_attempts: config.retry_attempts.max(1),
            backoff: Duration::from_secs(1),
        })
    }

    fn request_agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into()
    }

    /// Streams may run far longer than a single request. The connection and
    /// the first response byte get the request timeout; the body gets a
    /// multiple of it so a stalled provider cannot park the reader forever.
    fn stream_agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_connect(Some(timeout))
            .timeout_recv_response(Some(timeout))
            .timeout_recv_body(Some(timeout * STREAM_BODY_TIMEOUT_FACTOR))
            .build()
            .into()
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::request_agent(timeout);
        self.stream_agent = Self::stream_agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry; later retries back off exponentially
    #[inline]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Check that the service is reachable and accepts the API key
    pub fn health_check(&self) -> anyhow::Result<()> {
        let url = self.endpoint("models")?;
        debug!("Performing health check against {}", url);

        self.make_request_with_retry(|| {
            self.agent
                .get(url.as_str())
                .header("Authorization", self.bearer())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })
        .context("Completion service is not reachable")?;

        info!("Health check passed for {}", self.base_url);
        Ok(())
    }

    /// Blocking embedding request
    pub fn embed_blocking(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = self.endpoint("embeddings")?;
        let request_json = serde_json::to_string(&EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        })
        .context("Failed to serialize embedding request")?;

        let response_text = self
            .make_request_with_retry(|| {
                self.agent
                    .post(url.as_str())
                    .header("Authorization", self.bearer())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to generate embedding")?;

        let response: EmbeddingResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("Embedding response contained no data"))?;

        if embedding.len() != self.embedding_dimension {
            return Err(anyhow!(
                "Embedding has {} dimensions, expected {}",
                embedding.len(),
                self.embedding_dimension
            ));
        }

        debug!("Generated embedding with {} dimensions", embedding.len());
        Ok(embedding)
    }

    /// Blocking, non-streaming chat completion
    pub fn complete_blocking(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> anyhow::Result<String> {
        let url = self.endpoint("chat/completions")?;
        let request_json = self.chat_request_json(messages, options, false)?;

        let response_text = self
            .make_request_with_retry(|| {
                self.agent
                    .post(url.as_str())
                    .header("Authorization", self.bearer())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to complete chat")?;

        let response: ChatResponse =
            serde_json::from_str(&response_text).context("Failed to parse chat response")?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("Chat response contained no choices"))
    }

    /// Read a streaming completion, forwarding tokens into `tx` until the
    /// provider finishes or the receiving side goes away.
    fn stream_blocking(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        tx: &mpsc::Sender<Result<String>>,
    ) -> Result<()> {
        let url = self
            .endpoint("chat/completions")
            .map_err(|e| StudyError::GenerationService(format!("{e:#}")))?;
        let request_json = self
            .chat_request_json(messages, options, true)
            .map_err(|e| StudyError::GenerationService(format!("{e:#}")))?;

        let response = self
            .stream_agent
            .post(url.as_str())
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .send(&request_json)
            .map_err(|e| StudyError::GenerationService(format!("stream request failed: {e}")))?;

        let reader = BufReader::new(response.into_body().into_reader());
        let forwarded = forward_stream_lines(reader, tx)?;
        debug!("Completion stream forwarded {} tokens", forwarded);
        Ok(())
    }

    fn chat_request_json(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> anyhow::Result<String> {
        serde_json::to_string(&ChatRequest {
            model: &self.chat_model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        })
        .context("Failed to serialize chat request")
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Failed to build URL for {path}"))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn make_request_with_retry<F>(&self, mut request_fn: F) -> anyhow::Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match request_fn() {
                Ok(response_text) => {
                    debug!("Request succeeded on attempt {}", attempt);
                    return Ok(response_text);
                }
                Err(error) => {
                    let should_retry = match &error {
                        ureq::Error::StatusCode(status) => {
                            if *status >= 500 || *status == 429 {
                                warn!(
                                    "Server error (status {}), attempt {}/{}",
                                    status, attempt, self.retry_attempts
                                );
                                true
                            } else {
                                warn!("Client error (status {}), not retrying", status);
                                return Err(anyhow!("Client error: HTTP {}", status));
                            }
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Timeout(_)
                        | ureq::Error::Io(_) => {
                            warn!(
                                "Transport error: {}, attempt {}/{}",
                                error, attempt, self.retry_attempts
                            );
                            true
                        }
                        _ => {
                            warn!("Non-retryable error: {}", error);
                            false
                        }
                    };

                    if !should_retry {
                        return Err(anyhow!("Non-retryable error: {}", error));
                    }

                    last_error = Some(anyhow!("Request error: {}", error));

                    if attempt < self.retry_attempts {
                        let delay = self.backoff * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_error.unwrap_or_else(|| anyhow!("Request failed after retries")))
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url.as_str())
            .field("embedding_model", &self.embedding_model)
            .field("chat_model", &self.chat_model)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmbeddingService for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let client = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.embed_blocking(&text))
            .await
            .map_err(|e| StudyError::EmbeddingService(format!("embedding task failed: {e}")))?
            .map_err(|e| StudyError::EmbeddingService(format!("{e:#}")))
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let client = self.clone();
        let messages = messages.to_vec();
        let options = *options;
        tokio::task::spawn_blocking(move || client.complete_blocking(&messages, &options))
            .await
            .map_err(|e| StudyError::GenerationService(format!("completion task failed: {e}")))?
            .map_err(|e| StudyError::GenerationService(format!("{e:#}")))
    }

    /// Tokens arrive through a bounded channel fed by a blocking reader.
    /// Connection failures surface as the first stream item.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream> {
        let (tx, rx) = mpsc::channel::<Result<String>>(STREAM_CHANNEL_CAPACITY);
        let client = self.clone();
        let messages = messages.to_vec();
        let options = *options;

        tokio::task::spawn_blocking(move || {
            if let Err(e) = client.stream_blocking(&messages, &options, &tx) {
                warn!("Completion stream failed: {}", e);
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }
}
