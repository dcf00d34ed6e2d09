//! Bounded, role-tagged view of the message log used as model input.

use serde::{Deserialize, Serialize};

use crate::character::Roster;
use crate::message::{Author, Message};

/// Which side of the chat an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextRole {
    User,
    Agent,
}

/// One entry of the context handed to the agent response client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: ContextRole,
    pub content: String,
}

/// Takes the trailing entries of the log, recomputed on every call.
#[derive(Debug, Clone, Copy)]
pub struct HistoryWindow {
    size: usize,
}

impl HistoryWindow {
    pub const DEFAULT_SIZE: usize = 10;

    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Build the context for the next turn from the full, current log.
    pub fn window_for(&self, log: &[Message], roster: &Roster) -> Vec<ContextEntry> {
        let start = log.len().saturating_sub(self.size);
        log[start..]
            .iter()
            .map(|message| match &message.author {
                Author::Agent { id } => ContextEntry {
                    role: ContextRole::Agent,
                    content: prefixed(roster.display_name(id), &message.content),
                },
                // Only characters are named; users and notices go in as-is.
                Author::User { .. } | Author::System => ContextEntry {
                    role: ContextRole::User,
                    content: message.content.clone(),
                },
            })
            .collect()
    }
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SIZE)
    }
}

fn prefixed(name: Option<&str>, content: &str) -> String {
    match name {
        Some(name) => format!("{}: {}", name, content),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::{AgentId, Character};

    fn roster() -> Roster {
        Roster::new(vec![Character::new("keeper", "Mira")])
    }

    #[test]
    fn test_empty_log_yields_empty_window() {
        assert!(HistoryWindow::default().window_for(&[], &roster()).is_empty());
    }

    #[test]
    fn test_tags_and_prefixes() {
        let log = vec![
            Message::from_user(None, "Is the light on?"),
            Message::from_agent(AgentId::from("keeper"), "Always."),
            Message::from_agent(AgentId::from("stranger"), "Who asks?"),
            Message::from_user(Some("Avi".to_string()), "Me."),
            Message::new(Author::System, "Thunder rolls."),
        ];

        let window = HistoryWindow::default().window_for(&log, &roster());
        let expected = vec![
            (ContextRole::User, "Is the light on?"),
            (ContextRole::Agent, "Mira: Always."),
            (ContextRole::Agent, "Who asks?"),
            (ContextRole::User, "Me."),
            (ContextRole::User, "Thunder rolls."),
        ];
        let actual: Vec<(ContextRole, &str)> = window
            .iter()
            .map(|e| (e.role, e.content.as_str()))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_keeps_only_trailing_entries() {
        let log: Vec<Message> = (0..25)
            .map(|i| Message::from_user(None, format!("m{}", i)))
            .collect();

        let window = HistoryWindow::default().window_for(&log, &roster());
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "m15");
        assert_eq!(window[9].content, "m24");

        let short = HistoryWindow::new(3).window_for(&log[..2], &roster());
        assert_eq!(short.len(), 2);
    }
}
