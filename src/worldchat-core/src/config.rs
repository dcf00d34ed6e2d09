//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::character::{AgentId, Character};
use crate::error::WorldError;
use crate::responder::ResponseMode;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    pub world: WorldConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub narration: NarrationConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Settings for the OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.6,
            max_tokens: 300,
        }
    }
}

/// The story world the characters live in.
#[derive(Debug, Clone, Deserialize)]
pub struct WorldConfig {
    pub name: String,
    pub storyline: String,
    /// Spoken language, as named in prompts (e.g. "Hebrew").
    #[serde(default = "default_language")]
    pub language: String,
    /// BCP-47 locale used to pick a local voice.
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub vocab: Option<String>,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub characters: Vec<Character>,
}

fn default_language() -> String {
    "English".to_string()
}

fn default_locale() -> String {
    "en-US".to_string()
}

/// Turn scheduler pacing and context size.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between autonomous turns, in milliseconds.
    pub pacing_ms: u64,
    /// Number of trailing log entries given to the agent as context.
    pub history_window: usize,
}

impl SchedulerConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pacing_ms: 2000,
            history_window: 10,
        }
    }
}

/// Narration settings for both synthesis providers and the player.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    /// Overrides `world.locale` for voice selection.
    pub locale: Option<String>,
    /// Local speaking rate (1.0 = normal).
    pub rate: f32,
    /// Local voice to prefer over locale matching.
    pub local_voice: Option<String>,
    /// Player command; `{file}` is replaced with the clip path.
    pub player_command: Vec<String>,
    pub remote: RemoteVoiceConfig,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            locale: None,
            rate: 0.9,
            local_voice: None,
            player_command: ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet", "{file}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            remote: RemoteVoiceConfig::default(),
        }
    }
}

/// ElevenLabs text-to-speech settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteVoiceConfig {
    pub api_base: String,
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for RemoteVoiceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.elevenlabs.io/v1".to_string(),
            voice_id: "pNInz6obpgDQGcFmaJgB".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

/// System prompt templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub character_template: String,
    pub vocab_hint: String,
    pub grammar_hint: String,
    pub autonomous_addendum: String,
    pub autonomous_nudge: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            character_template: DEFAULT_CHARACTER_PROMPT.to_string(),
            vocab_hint: "Try to use these vocabulary words when it feels natural: {vocab}"
                .to_string(),
            grammar_hint: "Practice these grammar patterns when speaking: {grammar}".to_string(),
            autonomous_addendum: DEFAULT_AUTONOMOUS_ADDENDUM.to_string(),
            autonomous_nudge: "Continue the conversation as {name}.".to_string(),
        }
    }
}

impl PromptsConfig {
    /// Build the system prompt for a character, with placeholders replaced.
    pub fn system_prompt(
        &self,
        character: &Character,
        world: &WorldConfig,
        mode: ResponseMode,
    ) -> String {
        let mut prompt = self
            .character_template
            .replace("{name}", &character.name)
            .replace("{storyline}", &world.storyline)
            .replace("{role}", &character.role_in_story)
            .replace("{appearance}", &character.appearance)
            .replace("{personality}", &character.personality)
            .replace("{instructions}", &character.instructions)
            .replace("{language}", &world.language);

        let vocab = world.vocab.as_deref().filter(|v| !v.trim().is_empty());
        let grammar = world.grammar.as_deref().filter(|g| !g.trim().is_empty());
        if vocab.is_some() || grammar.is_some() {
            prompt.push_str("\n\nLANGUAGE LEARNING FOCUS:");
            if let Some(vocab) = vocab {
                prompt.push_str("\n- ");
                prompt.push_str(&self.vocab_hint.replace("{vocab}", vocab));
            }
            if let Some(grammar) = grammar {
                prompt.push_str("\n- ");
                prompt.push_str(&self.grammar_hint.replace("{grammar}", grammar));
            }
        }

        if mode == ResponseMode::Autonomous {
            prompt.push('\n');
            prompt.push_str(&self.autonomous_addendum);
        }

        prompt
    }

    /// The trailing user turn that asks a character to keep talking.
    pub fn nudge(&self, character: &Character) -> String {
        self.autonomous_nudge.replace("{name}", &character.name)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WorldError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| WorldError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, WorldError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| WorldError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), WorldError> {
        let mut seen: Vec<&AgentId> = Vec::new();
        for character in &self.world.characters {
            if seen.contains(&&character.id) {
                return Err(WorldError::ConfigError(format!(
                    "Duplicate character id '{}'",
                    character.id
                )));
            }
            seen.push(&character.id);
        }
        Ok(())
    }

    /// Locale used for local voice selection.
    pub fn narration_locale(&self) -> &str {
        self.narration
            .locale
            .as_deref()
            .unwrap_or(&self.world.locale)
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config {
        agent: AgentConfig::default(),
        world: WorldConfig {
            name: "The Lighthouse".to_string(),
            storyline: "A storm has cut off a small island town. The lighthouse keeper, \
                        the baker and a visiting cartographer wait out the night together."
                .to_string(),
            language: default_language(),
            locale: default_locale(),
            vocab: None,
            grammar: None,
            characters: vec![
                Character::new("keeper", "Mira")
                    .with_role("The lighthouse keeper who has kept the light burning for 30 years.")
                    .with_appearance("Grey oilskin coat, salt in her hair.")
                    .with_personality("Calm, dry-humoured, distrustful of maps."),
                Character::new("baker", "Tomas")
                    .with_role("The town baker who knows every rumour on the island.")
                    .with_personality("Warm, chatty, easily frightened by thunder."),
                Character::new("cartographer", "Ines")
                    .with_role("A visitor charting the coastline for the mainland government.")
                    .with_personality("Precise, curious, a little arrogant.")
                    .with_instructions("Mention the unfinished chart of the northern reef."),
            ],
        },
        scheduler: SchedulerConfig::default(),
        narration: NarrationConfig::default(),
        prompts: PromptsConfig::default(),
    }
}

const DEFAULT_CHARACTER_PROMPT: &str = r#"You are {name}, a character in the following story: {storyline}

Your role in the story: {role}

Your appearance: {appearance}

Your personality: {personality}

Special instructions: {instructions}

LANGUAGE REQUIREMENT:
- You MUST respond ONLY in {language}
- Never switch to another language, even if someone else does

FORMATTING RULES:
- Do NOT start your response with your name or any character label
- Your name is displayed separately, so output only what you say
- Do NOT include stage directions, asterisks or markdown

IMPORTANT:
- Stay in character at all times
- If something is outside your character's knowledge, say so in character
- Keep responses short and simple enough for a beginner learner"#;

const DEFAULT_AUTONOMOUS_ADDENDUM: &str = r#"- You are having a conversation with other characters in the story
- Address the other characters directly and react to what they said
- Add new thoughts instead of repeating what others said
- Keep responses to 1-3 sentences"#;
