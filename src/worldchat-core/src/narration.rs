//! Audio narration pipeline.
//!
//! A FIFO queue of narration items drained one at a time through a single
//! output channel. Each item is synthesized remotely when possible and
//! spoken by the local provider otherwise. `play_immediate` preempts
//! everything and drops whatever was waiting.
//!
//! State lives in one [`PlaybackState`] behind a mutex that is never held
//! across an await. Every interrupt or clear bumps the state's epoch; a
//! drain task only touches the state while its epoch is current, so a
//! stale task retires instead of racing the new owner of the channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::speech::{AudioSink, LocalSpeaker, RemoteSynthesizer};

/// One unit of audio work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrationItem {
    pub id: String,
    pub text: String,
}

/// How one item's synthesis-and-play settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Remote audio played to the end.
    Remote,
    /// Remote synthesis failed; the local provider spoke the text.
    LocalFallback,
    /// Nothing could be played; the item is finished anyway.
    Failed,
    /// Silenced by `play_immediate` or `clear_queue`.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Draining,
}

struct PlaybackState {
    queue: VecDeque<NarrationItem>,
    phase: Phase,
    current_id: Option<String>,
    current_cancel: Option<CancellationToken>,
    epoch: u64,
}

impl PlaybackState {
    /// Silence whatever is playing and forget the queue.
    fn interrupt(&mut self) -> usize {
        self.epoch += 1;
        if let Some(cancel) = self.current_cancel.take() {
            cancel.cancel();
        }
        self.current_id = None;
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}

struct Shared {
    state: Mutex<PlaybackState>,
    /// Held for the whole synthesis-and-play of one item.
    output: tokio::sync::Mutex<()>,
    remote: Arc<dyn RemoteSynthesizer>,
    local: Arc<dyn LocalSpeaker>,
    sink: Arc<dyn AudioSink>,
    locale: String,
    idle: watch::Sender<bool>,
}

/// Handle to the narration pipeline. Clones share the same queue.
#[derive(Clone)]
pub struct Narrator {
    shared: Arc<Shared>,
}

impl Narrator {
    pub fn new(
        remote: Arc<dyn RemoteSynthesizer>,
        local: Arc<dyn LocalSpeaker>,
        sink: Arc<dyn AudioSink>,
        locale: impl Into<String>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PlaybackState {
                    queue: VecDeque::new(),
                    phase: Phase::Idle,
                    current_id: None,
                    current_cancel: None,
                    epoch: 0,
                }),
                output: tokio::sync::Mutex::new(()),
                remote,
                local,
                sink,
                locale: locale.into(),
                idle,
            }),
        }
    }

    /// Queue an item behind whatever is playing. Must be called inside a
    /// tokio runtime.
    pub fn enqueue(&self, id: impl Into<String>, text: impl Into<String>) {
        let item = NarrationItem {
            id: id.into(),
            text: text.into(),
        };
        let mut state = self.shared.lock();
        debug!(id = %item.id, queued = state.queue.len() + 1, "narration enqueued");
        state.queue.push_back(item);

        if state.phase == Phase::Idle {
            state.phase = Phase::Draining;
            self.shared.idle.send_replace(false);
            let epoch = state.epoch;
            drop(state);
            tokio::spawn(Shared::drain(Arc::clone(&self.shared), epoch));
        }
    }

    /// Stop everything, drop the queue and speak `text` now.
    ///
    /// Resolves once the text has settled. Items queued before the call are
    /// never played; items queued while it plays are drained afterwards.
    /// Dropping the future silences the item and hands the channel back.
    pub async fn play_immediate(&self, text: &str) -> PlaybackOutcome {
        let id = format!("immediate-{}", Uuid::new_v4());
        let (cancel, epoch) = {
            let mut state = self.shared.lock();
            let dropped = state.interrupt();
            let cancel = CancellationToken::new();
            state.phase = Phase::Draining;
            state.current_id = Some(id.clone());
            state.current_cancel = Some(cancel.clone());
            self.shared.idle.send_replace(false);
            info!(dropped, "narration interrupted");
            (cancel, state.epoch)
        };

        let _settle = ImmediateSettle {
            shared: Arc::clone(&self.shared),
            epoch,
        };
        self.shared.narrate(&id, text, &cancel).await
    }

    /// Stop playback and empty the queue.
    pub fn clear_queue(&self) {
        let mut state = self.shared.lock();
        if state.phase == Phase::Idle && state.queue.is_empty() {
            return;
        }
        let dropped = state.interrupt();
        state.phase = Phase::Idle;
        self.shared.idle.send_replace(true);
        info!(dropped, "narration cleared");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().phase == Phase::Draining
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    pub fn currently_playing_id(&self) -> Option<String> {
        self.shared.lock().current_id.clone()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Resolve once the pipeline is idle.
    pub async fn wait_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

/// Hands the channel back once an immediate item settles, including when
/// the `play_immediate` future is dropped part way through.
struct ImmediateSettle {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Drop for ImmediateSettle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.epoch != self.epoch {
            return;
        }
        if let Some(cancel) = state.current_cancel.take() {
            cancel.cancel();
        }
        state.current_id = None;

        if !state.queue.is_empty() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                drop(state);
                runtime.spawn(Shared::drain(Arc::clone(&self.shared), self.epoch));
                return;
            }
            warn!(queued = state.queue.len(), "no runtime to resume narration");
        }
        state.phase = Phase::Idle;
        self.shared.idle.send_replace(true);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Play queued items in order until the queue is empty or `epoch` is
    /// superseded.
    async fn drain(self: Arc<Self>, epoch: u64) {
        loop {
            let (item, cancel) = {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return;
                }
                let Some(item) = state.queue.pop_front() else {
                    state.phase = Phase::Idle;
                    state.current_id = None;
                    state.current_cancel = None;
                    self.idle.send_replace(true);
                    debug!("narration queue drained");
                    return;
                };
                let cancel = CancellationToken::new();
                state.current_id = Some(item.id.clone());
                state.current_cancel = Some(cancel.clone());
                (item, cancel)
            };

            self.narrate(&item.id, &item.text, &cancel).await;

            let mut state = self.lock();
            if state.epoch == epoch {
                state.current_id = None;
                state.current_cancel = None;
            }
        }
    }

    /// Synthesize and play one item, falling back to the local provider.
    async fn narrate(&self, id: &str, text: &str, cancel: &CancellationToken) -> PlaybackOutcome {
        let _output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PlaybackOutcome::Cancelled,
            guard = self.output.lock() => guard,
        };

        let remote = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PlaybackOutcome::Cancelled,
            result = self.remote.synthesize(text) => result,
        };

        let outcome = match remote {
            Ok(audio) if !audio.is_empty() => {
                let played = self.sink.play(audio, cancel).await;
                if cancel.is_cancelled() {
                    PlaybackOutcome::Cancelled
                } else if let Err(e) = played {
                    warn!(id, error = %e, "remote audio did not play, using local voice");
                    self.speak_locally(id, text, cancel).await
                } else {
                    PlaybackOutcome::Remote
                }
            }
            Ok(_) => {
                warn!(id, "remote synthesis returned no audio, using local voice");
                self.speak_locally(id, text, cancel).await
            }
            Err(e) => {
                warn!(id, error = %e, "remote synthesis unavailable, using local voice");
                self.speak_locally(id, text, cancel).await
            }
        };
        debug!(id, ?outcome, "narration item settled");
        outcome
    }

    async fn speak_locally(&self, id: &str, text: &str, cancel: &CancellationToken) -> PlaybackOutcome {
        let spoken = async {
            self.local.ensure_voices_ready().await?;
            self.local.speak(text, &self.locale, cancel).await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PlaybackOutcome::Cancelled,
            result = spoken => result,
        };

        match result {
            _ if cancel.is_cancelled() => PlaybackOutcome::Cancelled,
            Ok(()) => PlaybackOutcome::LocalFallback,
            Err(e) => {
                error!(id, error = %e, "local synthesis failed, skipping item");
                PlaybackOutcome::Failed
            }
        }
    }
}
