//! Per-task progress broadcaster backed by `tokio::sync::broadcast`.
//!
//! [`ProgressBroadcaster`] keeps one bounded broadcast channel per live
//! task. Publishing never blocks: a subscriber that falls behind loses
//! its oldest buffered events and observes a lag, while the producer and
//! every other subscriber carry on. The terminal event is always the last
//! one sent on a channel, so it survives any lag.

use std::collections::HashMap;

use futures::Stream;
use miktos_core::task::ProgressEvent;
use miktos_core::types::TaskId;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Default per-subscriber buffer.
const DEFAULT_CAPACITY: usize = 64;

/// Largest per-subscriber buffer. Larger requests are clamped.
pub const MAX_CAPACITY: usize = 65_536;

pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<TaskId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressBroadcaster {
    /// Create a broadcaster whose per-task channels buffer `capacity`
    /// events per subscriber, clamped to `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.clamp(1, MAX_CAPACITY),
        }
    }

    /// Open the channel for a task. Idempotent.
    pub fn open(&self, task_id: TaskId) {
        self.channels
            .write()
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Publish a non-terminal event.
    ///
    /// Dropped silently when nobody is subscribed or the channel has
    /// already been retired.
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(sender) = self.channels.read().get(&event.task_id) {
            // Ignore the SendError, it only means there are zero receivers.
            let _ = sender.send(event);
        }
    }

    /// Publish the terminal event for a task and retire its channel.
    ///
    /// Subscribers still drain everything buffered before the terminal
    /// event; new subscribers can no longer attach.
    pub fn finish(&self, event: ProgressEvent) {
        let sender = self.channels.write().remove(&event.task_id);
        match sender {
            Some(sender) => {
                let receivers = sender.receiver_count();
                let _ = sender.send(event);
                tracing::debug!(receivers, "Progress channel closed");
            }
            None => {
                tracing::debug!(task_id = %event.task_id, "Finish on a retired progress channel");
            }
        }
    }

    /// Attach to a live task's channel.
    ///
    /// Returns `None` when no channel is open for the task (unknown or
    /// already finished). Only events published after this call are
    /// delivered.
    pub fn subscribe(&self, task_id: TaskId) -> Option<ProgressSubscription> {
        self.channels
            .read()
            .get(&task_id)
            .map(|sender| ProgressSubscription::live(task_id, sender.subscribe()))
    }

    /// Number of subscribers currently attached to a task.
    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.channels
            .read()
            .get(&task_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of tasks with an open channel.
    pub fn open_channels(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A finite stream of progress events for one task.
///
/// Ends right after yielding an event whose state is terminal. If the
/// channel closes without one (the producer vanished), the stream simply
/// ends.
pub struct ProgressSubscription {
    task_id: TaskId,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    pending: Option<ProgressEvent>,
}

impl ProgressSubscription {
    fn live(task_id: TaskId, receiver: broadcast::Receiver<ProgressEvent>) -> Self {
        Self {
            task_id,
            receiver: Some(receiver),
            pending: None,
        }
    }

    /// A subscription that yields only `event` and then ends. Used for
    /// tasks that were already terminal when the subscriber attached.
    pub fn terminal(event: ProgressEvent) -> Self {
        Self {
            task_id: event.task_id,
            receiver: None,
            pending: Some(event),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Next event, or `None` once the stream is exhausted.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.pending.take() {
            self.receiver = None;
            return Some(event);
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.receiver = None;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        skipped,
                        "Progress subscriber lagged, oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Convert into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next_event().await.map(|event| (event, sub))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
