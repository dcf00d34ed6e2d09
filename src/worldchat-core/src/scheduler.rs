//! Turn scheduler.
//!
//! Drives an unattended conversation: the participants speak in strict
//! round-robin order, one turn at a time, until the run is stopped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::character::AgentId;
use crate::conversation::Conversation;
use crate::error::WorldError;
use crate::message::Message;
use crate::responder::ResponseMode;

/// Speaker order for one run: a fixed participant list and a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    participants: Arc<[AgentId]>,
    cursor: usize,
}

impl Rotation {
    pub const MIN_PARTICIPANTS: usize = 2;

    pub fn new(participants: Vec<AgentId>) -> Result<Self, WorldError> {
        if participants.len() < Self::MIN_PARTICIPANTS {
            return Err(WorldError::InsufficientParticipants {
                min: Self::MIN_PARTICIPANTS,
                actual: participants.len(),
            });
        }
        Ok(Self {
            participants: participants.into(),
            cursor: 0,
        })
    }

    /// The agent whose turn it is.
    pub fn current(&self) -> &AgentId {
        &self.participants[self.cursor % self.participants.len()]
    }

    /// The rotation after one more turn, whatever that turn's outcome.
    pub fn next(&self) -> Self {
        Self {
            participants: Arc::clone(&self.participants),
            cursor: self.cursor + 1,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn participants(&self) -> &[AgentId] {
        &self.participants
    }
}

/// Callback for conversation events.
pub type ConversationCallback = Arc<dyn Fn(ConversationEvent) + Send + Sync>;

/// Events emitted during a run.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    RunStarted { participants: Vec<AgentId> },
    /// An agent is about to be asked for its turn.
    TurnStarted { agent: AgentId, name: String },
    MessageAppended { message: Message },
    /// The agent contributed nothing this cycle.
    TurnFailed { agent: AgentId, reason: String },
    RunEnded,
}

struct ActiveRun {
    participants: Arc<[AgentId]>,
    token: CancellationToken,
    cursor: Arc<AtomicUsize>,
    done: watch::Receiver<bool>,
}

impl ActiveRun {
    fn finished(&self) -> bool {
        *self.done.borrow() || self.done.has_changed().is_err()
    }
}

/// Runs at most one round-robin loop at a time over a conversation.
///
/// Dropping the scheduler stops its run the same way `stop()` does.
pub struct TurnScheduler {
    conversation: Conversation,
    pacing: Duration,
    callback: Option<ConversationCallback>,
    run: Mutex<Option<ActiveRun>>,
}

impl TurnScheduler {
    pub const DEFAULT_PACING: Duration = Duration::from_millis(2000);

    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            pacing: Self::DEFAULT_PACING,
            callback: None,
            run: Mutex::new(None),
        }
    }

    /// Set the delay between turns.
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Set a callback for conversation events.
    pub fn with_callback(mut self, callback: ConversationCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a run in the background. Must be called inside a tokio runtime.
    ///
    /// Rejected while a previous run is active or still finishing the turn
    /// that was in flight when it was stopped.
    pub fn start(&self, participants: Vec<AgentId>) -> Result<(), WorldError> {
        let rotation = Rotation::new(participants)?;

        let mut run = self.active();
        if let Some(active) = run.as_ref() {
            if !active.finished() {
                return Err(WorldError::AlreadyRunning);
            }
        }

        let token = CancellationToken::new();
        let cursor = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = watch::channel(false);

        info!(
            participants = rotation.participants().len(),
            pacing_ms = self.pacing.as_millis() as u64,
            "starting conversation run"
        );

        *run = Some(ActiveRun {
            participants: Arc::clone(&rotation.participants),
            token: token.clone(),
            cursor: Arc::clone(&cursor),
            done: done_rx,
        });

        let run_loop = RunLoop {
            conversation: self.conversation.clone(),
            pacing: self.pacing,
            callback: self.callback.clone(),
            token,
            cursor,
            done: done_tx,
        };
        tokio::spawn(run_loop.run(rotation));

        Ok(())
    }

    /// Ask the run to end. The turn in flight, if any, still completes.
    pub fn stop(&self) {
        if let Some(active) = self.active().as_ref() {
            if !active.token.is_cancelled() {
                info!("stopping conversation run");
                active.token.cancel();
            }
        }
    }

    /// Wait until the current run's loop has exited.
    pub async fn wait(&self) {
        let done = self.active().as_ref().map(|active| active.done.clone());
        if let Some(mut done) = done {
            // Err means the loop task is gone, which is just as final.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.active()
            .as_ref()
            .is_some_and(|active| !active.token.is_cancelled() && !active.finished())
    }

    /// Turns taken so far in the current (or last) run.
    pub fn cursor(&self) -> usize {
        self.active()
            .as_ref()
            .map_or(0, |active| active.cursor.load(Ordering::SeqCst))
    }

    /// The participant set frozen at `start()`.
    pub fn participants(&self) -> Vec<AgentId> {
        self.active()
            .as_ref()
            .map(|active| active.participants.to_vec())
            .unwrap_or_default()
    }
}

impl Drop for TurnScheduler {
    fn drop(&mut self) {
        if let Some(active) = self.active().as_ref() {
            active.token.cancel();
        }
    }
}

struct RunLoop {
    conversation: Conversation,
    pacing: Duration,
    callback: Option<ConversationCallback>,
    token: CancellationToken,
    cursor: Arc<AtomicUsize>,
    done: watch::Sender<bool>,
}

impl RunLoop {
    async fn run(self, mut rotation: Rotation) {
        self.emit(ConversationEvent::RunStarted {
            participants: rotation.participants().to_vec(),
        });

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let agent = rotation.current().clone();
            self.take_turn(&agent).await;

            rotation = rotation.next();
            self.cursor.store(rotation.cursor(), Ordering::SeqCst);

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.pacing) => {}
            }
        }

        info!(turns = rotation.cursor(), "conversation run ended");
        self.emit(ConversationEvent::RunEnded);
        self.done.send_replace(true);
    }

    async fn take_turn(&self, agent: &AgentId) {
        let name = self
            .conversation
            .roster()
            .display_name(agent)
            .unwrap_or(agent.as_str())
            .to_string();
        self.emit(ConversationEvent::TurnStarted {
            agent: agent.clone(),
            name,
        });

        match self
            .conversation
            .take_turn(agent, ResponseMode::Autonomous)
            .await
        {
            Ok(message) => {
                debug!(agent = %agent, message = %message.id, "turn appended");
                self.emit(ConversationEvent::MessageAppended { message });
            }
            Err(e) => {
                warn!(agent = %agent, error = %e, "turn skipped");
                self.emit(ConversationEvent::TurnFailed {
                    agent: agent.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: ConversationEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::{Character, Roster};
    use crate::conversation::testing::ScriptedResponder;
    use crate::message::{InMemoryMessageLog, MessageLog};
    use tokio::sync::Notify;

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|n| AgentId::from(*n)).collect()
    }

    fn scheduler(responder: Arc<ScriptedResponder>) -> (TurnScheduler, Arc<InMemoryMessageLog>) {
        let log = Arc::new(InMemoryMessageLog::new());
        let roster = Roster::new(vec![
            Character::new("a", "Ana"),
            Character::new("b", "Ben"),
            Character::new("c", "Cai"),
        ]);
        let conversation = Conversation::new(log.clone(), responder, Arc::new(roster));
        (
            TurnScheduler::new(conversation).with_pacing(Duration::from_millis(1)),
            log,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_rotation_cycles_in_order() {
        let mut rotation = Rotation::new(ids(&["a", "b", "c"])).unwrap();
        let mut speakers = Vec::new();
        for _ in 0..7 {
            speakers.push(rotation.current().to_string());
            rotation = rotation.next();
        }
        assert_eq!(speakers, vec!["a", "b", "c", "a", "b", "c", "a"]);
        assert_eq!(rotation.cursor(), 7);
    }

    #[test]
    fn test_rotation_requires_two_participants() {
        assert!(matches!(
            Rotation::new(ids(&["a"])),
            Err(WorldError::InsufficientParticipants { min: 2, actual: 1 })
        ));
        assert!(Rotation::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_round_robin_survives_failures() {
        let responder = Arc::new(ScriptedResponder::failing(&["b"]));
        let (scheduler, log) = scheduler(responder.clone());

        scheduler.start(ids(&["a", "b", "c"])).unwrap();
        wait_until(|| responder.calls().len() >= 9).await;
        scheduler.stop();
        scheduler.wait().await;

        let calls = responder.calls();
        let participants = ids(&["a", "b", "c"]);
        for (i, call) in calls.iter().enumerate() {
            assert_eq!(call.agent, participants[i % 3], "turn {}", i);
            assert_eq!(call.mode, ResponseMode::Autonomous);
        }
        assert_eq!(scheduler.cursor(), calls.len());

        let authors: Vec<String> = log
            .list()
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.agent_id().map(|id| id.to_string()))
            .collect();
        assert!(authors.len() >= 6);
        for (i, author) in authors.iter().enumerate() {
            assert_eq!(author, if i % 2 == 0 { "a" } else { "c" });
        }
    }

    #[tokio::test]
    async fn test_context_reflects_previous_turns() {
        let responder = Arc::new(ScriptedResponder::default());
        let (scheduler, _log) = scheduler(responder.clone());

        scheduler.start(ids(&["a", "b"])).unwrap();
        wait_until(|| responder.calls().len() >= 3).await;
        scheduler.stop();
        scheduler.wait().await;

        let calls = responder.calls();
        assert!(calls[0].context.is_empty());
        assert_eq!(calls[1].context.len(), 1);
        assert_eq!(calls[1].context[0].content, "Ana: a #1");
        assert_eq!(calls[2].context[1].content, "Ben: b #2");
    }

    #[tokio::test]
    async fn test_start_rejections() {
        let gate = Arc::new(Notify::new());
        let responder = Arc::new(ScriptedResponder {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (scheduler, _log) = scheduler(responder.clone());

        assert!(matches!(
            scheduler.start(ids(&["a"])),
            Err(WorldError::InsufficientParticipants { .. })
        ));
        assert!(!scheduler.is_running());

        scheduler.start(ids(&["a", "b"])).unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start(ids(&["b", "c"])),
            Err(WorldError::AlreadyRunning)
        ));
        assert_eq!(scheduler.participants(), ids(&["a", "b"]));

        responder.entered.notified().await;
        scheduler.stop();
        assert!(!scheduler.is_running());
        // Still finishing the in-flight turn.
        assert!(matches!(
            scheduler.start(ids(&["b", "c"])),
            Err(WorldError::AlreadyRunning)
        ));

        gate.notify_one();
        scheduler.wait().await;
        scheduler.start(ids(&["b", "c"])).unwrap();
        assert_eq!(scheduler.participants(), ids(&["b", "c"]));
        scheduler.stop();
        gate.notify_one();
        scheduler.wait().await;
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_turn_finish() {
        let gate = Arc::new(Notify::new());
        let responder = Arc::new(ScriptedResponder {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let (scheduler, log) = scheduler(responder.clone());

        scheduler.start(ids(&["a", "b"])).unwrap();
        responder.entered.notified().await;
        scheduler.stop();
        gate.notify_one();
        scheduler.wait().await;

        assert_eq!(responder.calls().len(), 1);
        let messages = log.list().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "a #1");
        assert_eq!(scheduler.cursor(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let responder = Arc::new(ScriptedResponder::default());
        let (scheduler, _log) = scheduler(responder.clone());

        scheduler.stop();
        scheduler.wait().await;

        scheduler.start(ids(&["a", "b"])).unwrap();
        scheduler.stop();
        scheduler.stop();
        scheduler.wait().await;
        scheduler.stop();

        assert!(!scheduler.is_running());
        assert!(responder.calls().len() <= 1);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        let responder = Arc::new(ScriptedResponder::failing(&["b"]));
        let (scheduler, _log) = scheduler(responder.clone());
        let scheduler = scheduler.with_callback(Arc::new(move |event: ConversationEvent| {
            let label = match event {
                ConversationEvent::RunStarted { .. } => "start".to_string(),
                ConversationEvent::TurnStarted { name, .. } => format!("turn:{}", name),
                ConversationEvent::MessageAppended { message } => format!("msg:{}", message.content),
                ConversationEvent::TurnFailed { agent, .. } => format!("fail:{}", agent),
                ConversationEvent::RunEnded => "end".to_string(),
            };
            sink.lock().unwrap().push(label);
        }));

        scheduler.start(ids(&["a", "b"])).unwrap();
        wait_until(|| responder.calls().len() >= 2).await;
        scheduler.stop();
        scheduler.wait().await;

        let events = events.lock().unwrap().clone();
        assert_eq!(
            &events[..5],
            &["start", "turn:Ana", "msg:a #1", "turn:Ben", "fail:b"]
        );
        assert_eq!(events.last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn test_dropping_scheduler_ends_run() {
        let responder = Arc::new(ScriptedResponder::default());
        let (scheduler, _log) = scheduler(responder.clone());
        let scheduler = scheduler.with_pacing(Duration::from_millis(10));

        scheduler.start(ids(&["a", "b"])).unwrap();
        responder.entered.notified().await;
        drop(scheduler);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(responder.calls().len(), 1);
    }
}
