// Generation module
// Prompt assembly, completion-service seam and the event stream handed to callers

pub mod events;
pub mod prompts;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::{Result, StudyError};

pub use events::{DONE_FRAME, GenerationEvent, sse_frames};
pub use prompts::{DEFAULT_EXAM_REFERENCE, TaskContext};

/// Tokens produced by a streaming completion, in provider order
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Events handed to the caller of [`GenerationOrchestrator::generate`]
pub type GenerationStream = BoxStream<'static, GenerationEvent>;

/// Called with the full text of a stream that finished cleanly
pub type FinishHook = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[inline]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1500,
        }
    }
}

impl From<&ServiceConfig> for CompletionOptions {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// External text-completion service
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions)
    -> Result<String>;

    /// Start a streaming completion. Dropping the returned stream must stop
    /// the service from producing further tokens.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<TokenStream>;
}

/// Everything one generation call needs
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task: TaskContext,
    /// Retrieved context, already ranked
    pub context: Vec<String>,
    /// Prior conversation turns, oldest first
    pub history: Vec<ChatMessage>,
    pub improvement_notes: Vec<String>,
}

impl GenerationRequest {
    #[inline]
    pub fn new(task: TaskContext) -> Self {
        Self {
            task,
            context: Vec::new(),
            history: Vec::new(),
            improvement_notes: Vec::new(),
        }
    }

    #[inline]
    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    #[inline]
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    #[inline]
    pub fn with_improvement_notes(mut self, notes: Vec<String>) -> Self {
        self.improvement_notes = notes;
        self
    }
}

enum Phase {
    Start {
        service: Arc<dyn CompletionService>,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
        on_finish: Option<FinishHook>,
    },
    Streaming {
        tokens: TokenStream,
        collected: String,
        on_finish: Option<FinishHook>,
    },
    Closing,
    Finished,
}

#[derive(Clone)]
pub struct GenerationOrchestrator {
    service: Arc<dyn CompletionService>,
    options: CompletionOptions,
}

impl GenerationOrchestrator {
    #[inline]
    pub fn new(service: Arc<dyn CompletionService>, options: CompletionOptions) -> Self {
        Self { service, options }
    }

    #[inline]
    pub fn options(&self) -> CompletionOptions {
        self.options
    }

    /// System instruction, prior turns, then the task's user turn
    pub fn build_messages(&self, request: &GenerationRequest) -> Vec<ChatMessage> {
        let context = prompts::join_context(&request.context);
        let notes: &[String] = if request.task.uses_improvement_notes() {
            &request.improvement_notes
        } else {
            &[]
        };

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage::system(prompts::system_prompt(
            &request.task,
            &context,
            notes,
        )));
        messages.extend(
            request
                .history
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );
        messages.push(ChatMessage::user(prompts::user_prompt(
            &request.task,
            &context,
        )));
        messages
    }

    /// Stream a generation as events.
    pub fn generate(&self, request: &GenerationRequest) -> GenerationStream {
        self.generate_with_hook(request, None)
    }

    /// Stream a generation, handing the full text to `on_finish` only when
    /// the completion service finished without error.
    ///
    /// The returned stream always ends with exactly one
    /// [`GenerationEvent::Done`]; a failure is reported as a single
    /// [`GenerationEvent::Error`] right before it. Dropping the stream drops
    /// the underlying token stream.
    pub fn generate_with_hook(
        &self,
        request: &GenerationRequest,
        on_finish: Option<FinishHook>,
    ) -> GenerationStream {
        info!("Starting {} generation", request.task.kind());
        let start = Phase::Start {
            service: Arc::clone(&self.service),
            messages: self.build_messages(request),
            options: self.options,
            on_finish,
        };

        stream::unfold(start, |phase| async move {
            let mut phase = phase;
            loop {
                phase = match phase {
                    Phase::Start {
                        service,
                        messages,
                        options,
                        on_finish,
                    } => match service.stream(&messages, &options).await {
                        Ok(tokens) => Phase::Streaming {
                            tokens,
                            collected: String::new(),
                            on_finish,
                        },
                        Err(e) => {
                            warn!("Completion service refused the stream: {}", e);
                            return Some((
                                GenerationEvent::Error(e.user_message().to_string()),
                                Phase::Closing,
                            ));
                        }
                    },
                    Phase::Streaming {
                        mut tokens,
                        mut collected,
                        on_finish,
                    } => match tokens.next().await {
                        Some(Ok(token)) if token.is_empty() => Phase::Streaming {
                            tokens,
                            collected,
                            on_finish,
                        },
                        Some(Ok(token)) => {
                            collected.push_str(&token);
                            return Some((
                                GenerationEvent::Content(token),
                                Phase::Streaming {
                                    tokens,
                                    collected,
                                    on_finish,
                                },
                            ));
                        }
                        Some(Err(e)) => {
                            warn!(
                                "Completion stream failed after {} characters: {}",
                                collected.len(),
                                e
                            );
                            return Some((
                                GenerationEvent::Error(e.user_message().to_string()),
                                Phase::Closing,
                            ));
                        }
                        None => {
                            debug!("Completion stream finished ({} characters)", collected.len());
                            if let Some(hook) = on_finish {
                                hook(collected).await;
                            }
                            return Some((GenerationEvent::Done, Phase::Finished));
                        }
                    },
                    Phase::Closing => return Some((GenerationEvent::Done, Phase::Finished)),
                    Phase::Finished => return None,
                };
            }
        })
        .boxed()
    }

    /// Non-streaming completion for tasks whose output is parsed as a whole
    pub async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        info!("Running {} completion", request.task.kind());
        let messages = self.build_messages(request);
        let text = self.service.complete(&messages, &self.options).await?;
        if text.trim().is_empty() {
            return Err(StudyError::GenerationService(
                "completion service returned an empty response".to_string(),
            ));
        }
        Ok(text)
    }

    /// Critique a previously generated artifact
    pub async fn self_critique(&self, artifact: &str) -> Result<String> {
        let request = GenerationRequest::new(TaskContext::SelfCritique {
            artifact: artifact.to_string(),
        });
        let critique = self.complete(&request).await?;
        Ok(critique.trim().to_string())
    }
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
