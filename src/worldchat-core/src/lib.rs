//! WorldChat Core Library
//!
//! Round-robin conversation between story characters, and narration of
//! what they say with remote speech synthesis and an on-device fallback.

pub mod character;
pub mod config;
pub mod conversation;
pub mod error;
pub mod history;
pub mod message;
pub mod narration;
pub mod responder;
pub mod scheduler;
pub mod speech;

pub use character::{AgentId, Character, Roster};
pub use config::{Config, default_config};
pub use conversation::Conversation;
pub use error::WorldError;
pub use history::{ContextEntry, ContextRole, HistoryWindow};
pub use message::{Author, InMemoryMessageLog, JsonlMessageLog, Message, MessageLog};
pub use narration::{NarrationItem, Narrator, Phase, PlaybackOutcome};
pub use responder::{AgentResponder, OpenAiResponder, ResponseMode};
pub use scheduler::{ConversationCallback, ConversationEvent, Rotation, TurnScheduler};
pub use speech::{
    AudioSink, CommandSink, ElevenLabsSynthesizer, KokoroSpeaker, LocalSpeaker,
    RemoteSynthesizer,
};
