//! Character definitions.
//!
//! Represents the scripted agents that take part in a conversation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an agent (character).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A character in a story world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: AgentId,
    /// Display name, shown in transcripts and used as a context prefix.
    pub name: String,
    /// What the character did in the story.
    #[serde(default)]
    pub role_in_story: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: String,
    /// Free-form instructions appended to the prompt.
    #[serde(default)]
    pub instructions: String,
}

impl Character {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(id),
            name: name.into(),
            role_in_story: String::new(),
            appearance: String::new(),
            personality: String::new(),
            instructions: String::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role_in_story = role.into();
        self
    }

    pub fn with_appearance(mut self, appearance: impl Into<String>) -> Self {
        self.appearance = appearance.into();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

/// The characters available in a world, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    characters: Vec<Character>,
}

impl Roster {
    pub fn new(characters: Vec<Character>) -> Self {
        Self { characters }
    }

    pub fn get(&self, id: &AgentId) -> Option<&Character> {
        self.characters.iter().find(|c| &c.id == id)
    }

    pub fn display_name(&self, id: &AgentId) -> Option<&str> {
        self.get(id).map(|c| c.name.as_str())
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    /// Resolve ids given on the command line, by id or case-insensitive name.
    pub fn resolve(&self, key: &str) -> Option<&Character> {
        self.characters
            .iter()
            .find(|c| c.id.as_str() == key)
            .or_else(|| {
                self.characters
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(key))
            })
    }
}
