use crate::transcript::{Role, Turn};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Sampling temperature used for every reply.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// Upper bound on the length of a generated reply, in tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Fixed generation parameters. These are deployment settings, not per-request
/// knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Represents the events that can be yielded from a streaming text response.
#[derive(Debug, Clone, PartialEq)]
pub enum LLMStreamEvent {
    TextChunk(String),
}

/// A stream of text chunks from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent>> + Send>>;

/// A generic client for interacting with an LLM.
///
/// The system prompt always travels separately from the turn history; `history`
/// holds only user and assistant turns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Makes a single, non-streaming call and returns the whole reply.
    async fn complete(&self, system_prompt: String, history: Vec<Turn>) -> Result<String>;

    /// Makes a streaming call that yields the reply in incremental pieces.
    async fn stream(&self, system_prompt: String, history: Vec<Turn>) -> Result<LLMStream>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
    params: GenerationParams,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
            params: GenerationParams::default(),
        }
    }

    fn build_request(
        &self,
        system_prompt: String,
        history: Vec<Turn>,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest> {
        let messages = to_wire_messages(system_prompt, history)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(self.params.temperature)
            .max_completion_tokens(self.params.max_tokens)
            .stream(stream)
            .build()?;
        Ok(request)
    }
}

/// Maps the system prompt and turn history onto the chat-completions wire
/// format, where the system context is the leading message.
fn to_wire_messages(
    system_prompt: String,
    history: Vec<Turn>,
) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut messages: Vec<ChatCompletionRequestMessage> = vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()?
            .into(),
    ];
    for turn in history {
        match turn.role {
            Role::User => messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
            ),
            Role::Assistant => messages.push(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content)
                    .build()?
                    .into(),
            ),
            // The system prompt is carried separately.
            Role::System => continue,
        }
    }
    Ok(messages)
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn complete(&self, system_prompt: String, history: Vec<Turn>) -> Result<String> {
        let request = self.build_request(system_prompt, history, false)?;
        let response = self.client.chat().create(request).await?;

        let answer = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        Ok(answer)
    }

    async fn stream(&self, system_prompt: String, history: Vec<Turn>) -> Result<LLMStream> {
        let request = self.build_request(system_prompt, history, true)?;
        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let content = response.choices.first()?.delta.content.clone()?;
                    if content.is_empty() {
                        None
                    } else {
                        Some(Ok(LLMStreamEvent::TextChunk(content)))
                    }
                }
                Err(e) => Some(Err(anyhow::Error::from(e))),
            }
        })))
    }
}
