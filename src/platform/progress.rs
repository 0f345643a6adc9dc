//! ProgressBus: per-deployment fan-in/fan-out of `ProgressMessage`s.
//!
//! Producers (pipeline steps, the image builder) publish into a registry entry
//! keyed by deployment id. Each entry keeps a replay buffer of the last
//! [`BUFFER_SIZE`] messages and a `tokio::sync::broadcast` channel of the
//! same capacity, so every subscriber gets an independent, ordered view and
//! a late subscriber still sees the history. A lagging subscriber loses the
//! oldest messages and receives a `warn "dropped"` marker in their place.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::models::{Level, ProgressMessage};

pub const BUFFER_SIZE: usize = 100;

/// Registry size at which finished entries become eligible for eviction.
const MAX_ENTRIES: usize = 100;

/// Minimum age of a finished entry before it can be evicted.
const FINISHED_TTL: Duration = Duration::from_secs(5 * 60);

pub const DROPPED_PAYLOAD: &str = "dropped";

struct Entry {
    buffer: VecDeque<ProgressMessage>,
    tx: broadcast::Sender<ProgressMessage>,
    finished: bool,
    updated_at: Instant,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BUFFER_SIZE);
        Self {
            buffer: VecDeque::with_capacity(BUFFER_SIZE),
            tx,
            finished: false,
            updated_at: Instant::now(),
        }
    }

    fn push(&mut self, msg: ProgressMessage) {
        if self.buffer.len() >= BUFFER_SIZE {
            self.buffer.pop_front();
        }
        self.buffer.push_back(msg.clone());
        self.finished = msg.is_final;
        self.updated_at = Instant::now();
        // No receivers is fine: the buffer still replays for late subscribers.
        let _ = self.tx.send(msg);
    }
}

#[derive(Default)]
pub struct ProgressBus {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, deployment_id: &str, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_ENTRIES && !entries.contains_key(deployment_id) {
            entries.retain(|_, e| !(e.finished && e.updated_at.elapsed() >= FINISHED_TTL));
        }
        let entry = entries
            .entry(deployment_id.to_string())
            .or_insert_with(Entry::new);
        f(entry)
    }

    /// Publish a message. Never blocks; a no-op once the deployment published
    /// its final message.
    pub fn publish(&self, deployment_id: &str, mut msg: ProgressMessage) {
        msg.deployment_id = deployment_id.to_string();
        self.with_entry(deployment_id, |entry| {
            if entry.finished {
                return;
            }
            entry.push(msg);
        });
    }

    /// Subscribe to a deployment. The stream replays the buffered history,
    /// then follows live messages; it ends after the final message or when
    /// `cancel` fires.
    pub fn subscribe(&self, deployment_id: &str, cancel: CancellationToken) -> Subscription {
        self.with_entry(deployment_id, |entry| Subscription {
            deployment_id: deployment_id.to_string(),
            replay: entry.buffer.clone(),
            rx: (!entry.finished).then(|| entry.tx.subscribe()),
            cancel,
            done: false,
        })
    }

    /// Like [`subscribe`](Self::subscribe), but `None` when the bus holds no
    /// history for the deployment instead of opening a new entry.
    pub fn subscribe_existing(
        &self,
        deployment_id: &str,
        cancel: CancellationToken,
    ) -> Option<Subscription> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(deployment_id).map(|entry| Subscription {
            deployment_id: deployment_id.to_string(),
            replay: entry.buffer.clone(),
            rx: (!entry.finished).then(|| entry.tx.subscribe()),
            cancel,
            done: false,
        })
    }

    /// Publish a synthetic terminal message and drop the registry entry.
    pub fn close(&self, deployment_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut entry) = entries.remove(deployment_id)
            && !entry.finished
        {
            entry.push(ProgressMessage::info(deployment_id, "closed").finished());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One subscriber's ordered view of a deployment's progress.
pub struct Subscription {
    deployment_id: String,
    replay: VecDeque<ProgressMessage>,
    rx: Option<broadcast::Receiver<ProgressMessage>>,
    cancel: CancellationToken,
    done: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        if self.done {
            return None;
        }
        if let Some(msg) = self.replay.pop_front() {
            if msg.is_final {
                self.done = true;
            }
            return Some(msg);
        }
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => {
                self.done = true;
                return None;
            }
        };
        let received = tokio::select! {
            _ = self.cancel.cancelled() => None,
            received = rx.recv() => Some(received),
        };
        match received {
            None | Some(Err(RecvError::Closed)) => {
                self.done = true;
                None
            }
            Some(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(
                    deployment_id = %self.deployment_id,
                    skipped,
                    "progress subscriber lagged"
                );
                Some(ProgressMessage::new(
                    &self.deployment_id,
                    Level::Warn,
                    DROPPED_PAYLOAD,
                ))
            }
            Some(Ok(msg)) => {
                if msg.is_final {
                    self.done = true;
                }
                Some(msg)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressMessage> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let msg = sub.recv().await?;
            Some((msg, sub))
        })
    }
}
