//! Single-turn execution shared by the autonomous scheduler and
//! interactive replies.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::character::{AgentId, Roster};
use crate::error::WorldError;
use crate::history::HistoryWindow;
use crate::message::{Message, MessageLog};
use crate::responder::{AgentResponder, ResponseMode};

/// The collaborators one conversation talks to.
#[derive(Clone)]
pub struct Conversation {
    log: Arc<dyn MessageLog>,
    responder: Arc<dyn AgentResponder>,
    roster: Arc<Roster>,
    window: HistoryWindow,
}

impl Conversation {
    pub fn new(
        log: Arc<dyn MessageLog>,
        responder: Arc<dyn AgentResponder>,
        roster: Arc<Roster>,
    ) -> Self {
        Self {
            log,
            responder,
            roster,
            window: HistoryWindow::default(),
        }
    }

    pub fn with_window(mut self, window: HistoryWindow) -> Self {
        self.window = window;
        self
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Ask `agent` for its next utterance over the live log and append it.
    pub async fn take_turn(
        &self,
        agent: &AgentId,
        mode: ResponseMode,
    ) -> Result<Message, WorldError> {
        let history = self.log.list().await?;
        let context = self.window.window_for(&history, &self.roster);
        debug!(agent = %agent, context = context.len(), ?mode, "requesting turn");

        let text = self.responder.generate(&context, agent, mode).await?;
        let message = Message::from_agent(agent.clone(), text);
        self.log.append(message.clone()).await?;
        Ok(message)
    }

    /// Post a user message, then let each selected character answer in order.
    ///
    /// A character that fails to answer is logged and skipped; the rest
    /// still get their turn.
    pub async fn reply(
        &self,
        text: &str,
        author_name: Option<String>,
        selected: &[AgentId],
    ) -> Result<Vec<Message>, WorldError> {
        if selected.is_empty() {
            return Err(WorldError::InsufficientParticipants { min: 1, actual: 0 });
        }
        if text.trim().is_empty() {
            return Err(WorldError::EmptyMessage);
        }

        self.log
            .append(Message::from_user(author_name, text.trim()))
            .await?;

        let mut replies = Vec::with_capacity(selected.len());
        for agent in selected {
            match self.take_turn(agent, ResponseMode::Interactive).await {
                Ok(message) => replies.push(message),
                Err(e) => warn!(agent = %agent, error = %e, "character did not reply"),
            }
        }
        Ok(replies)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by the core's tests.

    use super::*;
    use crate::history::ContextEntry;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Record of one `generate` call.
    #[derive(Debug, Clone)]
    pub struct Call {
        pub agent: AgentId,
        pub mode: ResponseMode,
        pub context: Vec<ContextEntry>,
    }

    /// Replies "<agent> #<n>" unless the agent is marked as failing.
    #[derive(Default)]
    pub struct ScriptedResponder {
        pub calls: Mutex<Vec<Call>>,
        pub failing: Mutex<HashSet<AgentId>>,
        pub delay: Option<Duration>,
        /// When set, every call waits for a `notify_one` before answering.
        pub gate: Option<Arc<Notify>>,
        /// Signalled when a call has started.
        pub entered: Arc<Notify>,
    }

    impl ScriptedResponder {
        pub fn failing(agents: &[&str]) -> Self {
            let responder = Self::default();
            responder
                .failing
                .lock()
                .unwrap()
                .extend(agents.iter().map(|a| AgentId::from(*a)));
            responder
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentResponder for ScriptedResponder {
        async fn generate(
            &self,
            context: &[ContextEntry],
            agent: &AgentId,
            mode: ResponseMode,
        ) -> Result<String, WorldError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call {
                    agent: agent.clone(),
                    mode,
                    context: context.to_vec(),
                });
                calls.len()
            };
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(agent) {
                return Err(WorldError::AgentUnavailable(format!("{} is offline", agent)));
            }
            Ok(format!("{} #{}", agent, n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedResponder;
    use super::*;
    use crate::character::Character;
    use crate::history::ContextRole;
    use crate::message::{Author, InMemoryMessageLog};

    fn conversation(responder: Arc<ScriptedResponder>) -> (Conversation, Arc<InMemoryMessageLog>) {
        let log = Arc::new(InMemoryMessageLog::new());
        let roster = Roster::new(vec![
            Character::new("mira", "Mira"),
            Character::new("tomas", "Tomas"),
        ]);
        (
            Conversation::new(log.clone(), responder, Arc::new(roster)),
            log,
        )
    }

    #[tokio::test]
    async fn test_take_turn_appends_agent_message() {
        let responder = Arc::new(ScriptedResponder::default());
        let (conversation, log) = conversation(responder.clone());

        let message = conversation
            .take_turn(&"mira".into(), ResponseMode::Autonomous)
            .await
            .unwrap();

        assert_eq!(message.content, "mira #1");
        assert_eq!(log.list().await.unwrap(), vec![message]);
        assert_eq!(responder.calls()[0].mode, ResponseMode::Autonomous);
    }

    #[tokio::test]
    async fn test_reply_runs_selected_in_order_and_skips_failures() {
        let responder = Arc::new(ScriptedResponder::failing(&["tomas"]));
        let (conversation, log) = conversation(responder.clone());
        let selected: Vec<AgentId> = vec!["tomas".into(), "mira".into()];

        let replies = conversation
            .reply("  Who lit the lamp?  ", Some("Avi".to_string()), &selected)
            .await
            .unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].agent_id(), Some(&AgentId::from("mira")));

        let calls = responder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].agent, AgentId::from("tomas"));
        assert_eq!(calls[1].mode, ResponseMode::Interactive);
        assert_eq!(calls[1].context.len(), 1);
        assert_eq!(calls[1].context[0].role, ContextRole::User);
        assert_eq!(calls[1].context[0].content, "Who lit the lamp?");

        let messages = log.list().await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].author,
            Author::User {
                name: Some("Avi".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_reply_rejects_empty_input() {
        let (conversation, log) = conversation(Arc::new(ScriptedResponder::default()));

        assert!(matches!(
            conversation.reply("hi", None, &[]).await,
            Err(WorldError::InsufficientParticipants { min: 1, actual: 0 })
        ));
        assert!(matches!(
            conversation.reply("   ", None, &["mira".into()]).await,
            Err(WorldError::EmptyMessage)
        ));
        assert!(log.list().await.unwrap().is_empty());
    }
}
