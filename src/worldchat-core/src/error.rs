//! Error types for the conversation and narration system.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorldError {
    #[error("Not enough participants: need at least {min}, got {actual}")]
    InsufficientParticipants { min: usize, actual: usize },

    #[error("A conversation run is already active")]
    AlreadyRunning,

    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Unknown character: {0}")]
    UnknownCharacter(String),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Remote synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    #[error("Local synthesis failed: {0}")]
    LocalSynthesisFailure(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Message log error: {0}")]
    MessageLog(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),
}
