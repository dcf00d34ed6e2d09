//! Agent response client.
//!
//! Turns a conversation context into one character's next utterance using
//! an OpenAI-compatible chat completion API.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::character::{AgentId, Character, Roster};
use crate::config::{AgentConfig, Config, PromptsConfig, WorldConfig};
use crate::error::WorldError;
use crate::history::{ContextEntry, ContextRole};

/// Whether a human is waiting for the reply or the characters talk alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    Interactive,
    Autonomous,
}

/// Produces one agent's next utterance.
#[async_trait]
pub trait AgentResponder: Send + Sync {
    async fn generate(
        &self,
        context: &[ContextEntry],
        agent: &AgentId,
        mode: ResponseMode,
    ) -> Result<String, WorldError>;
}

const MAX_ATTEMPTS: u32 = 3;

/// Responder backed by any OpenAI-compatible endpoint.
pub struct OpenAiResponder {
    client: Client<OpenAIConfig>,
    agent: AgentConfig,
    world: WorldConfig,
    prompts: PromptsConfig,
    roster: Roster,
}

impl OpenAiResponder {
    pub fn new(api_key: &str, config: &Config) -> Result<Self, WorldError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WorldError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(&config.agent.api_base);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            agent: config.agent.clone(),
            world: config.world.clone(),
            prompts: config.prompts.clone(),
            roster: Roster::new(config.world.characters.clone()),
        })
    }

    /// Assemble the chat request messages for one turn.
    fn build_messages(
        &self,
        character: &Character,
        context: &[ContextEntry],
        mode: ResponseMode,
    ) -> Vec<ChatCompletionRequestMessage> {
        build_messages(&self.prompts, &self.world, character, context, mode)
    }
}

fn build_messages(
    prompts: &PromptsConfig,
    world: &WorldConfig,
    character: &Character,
    context: &[ContextEntry],
    mode: ResponseMode,
) -> Vec<ChatCompletionRequestMessage> {
    let mut messages = Vec::with_capacity(context.len() + 2);
    messages.push(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessage {
            content: prompts.system_prompt(character, world, mode).into(),
            name: None,
        },
    ));

    for entry in context {
        messages.push(match entry.role {
            ContextRole::Agent => {
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(entry.content.clone().into()),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            ContextRole::User => {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                    content: entry.content.clone().into(),
                    name: None,
                })
            }
        });
    }

    if mode == ResponseMode::Autonomous {
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: prompts.nudge(character).into(),
                name: None,
            },
        ));
    }

    messages
}

#[async_trait]
impl AgentResponder for OpenAiResponder {
    async fn generate(
        &self,
        context: &[ContextEntry],
        agent: &AgentId,
        mode: ResponseMode,
    ) -> Result<String, WorldError> {
        let character = self
            .roster
            .get(agent)
            .ok_or_else(|| WorldError::UnknownCharacter(agent.to_string()))?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.agent.model)
            .temperature(self.agent.temperature)
            .max_completion_tokens(self.agent.max_tokens)
            .messages(self.build_messages(character, context, mode))
            .build()?;

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // 2s, 4s
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }

            match self.client.chat().create(request.clone()).await {
                Ok(response) => {
                    let raw = response
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default();
                    let text = strip_name_label(&sanitize_response(&raw), &character.name);
                    if text.is_empty() {
                        return Err(WorldError::AgentUnavailable(format!(
                            "{} returned an empty response",
                            character.name
                        )));
                    }
                    debug!(agent = %agent, chars = text.len(), "agent responded");
                    return Ok(text);
                }
                Err(e) => {
                    warn!(agent = %agent, attempt = attempt + 1, error = %e, "chat completion failed");
                    last_error = Some(e);
                }
            }
        }

        Err(WorldError::AgentUnavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown API error after retries".to_string()),
        ))
    }
}

static REASONING_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<(thinking|think|reflection|reflect|internal|reasoning|thought|scratchpad|scratch|plan|analysis)\b[^>]*>.*?</(thinking|think|reflection|reflect|internal|reasoning|thought|scratchpad|scratch|plan|analysis)>",
    )
    .ok()
});
static STRAY_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"</?\w+[^>]*>").ok());
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Strip reasoning blocks, stray tags and markdown emphasis; collapse whitespace.
fn sanitize_response(response: &str) -> String {
    let mut result = response.to_string();

    if let Some(re) = REASONING_BLOCK.as_ref() {
        result = re.replace_all(&result, "").to_string();
    }

    // Clean up any remaining orphaned tags
    if let Some(re) = STRAY_TAG.as_ref() {
        result = re.replace_all(&result, "").to_string();
    }

    result = result.replace('*', "");

    if let Some(re) = WHITESPACE.as_ref() {
        result = re.replace_all(&result, " ").to_string();
    }

    result.trim().to_string()
}

/// Remove a leading "Name:" label the model sometimes adds despite the prompt.
fn strip_name_label(text: &str, name: &str) -> String {
    let pattern = format!(r"^(?i:{})\s*[:：]\s*", regex::escape(name));
    match Regex::new(&pattern) {
        Ok(re) => re.replace(text, "").into_owned(),
        Err(_) => text.to_string(),
    }
}
