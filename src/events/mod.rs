//! Process-wide event bus
//!
//! A cloneable handle around a tokio broadcast channel plus a bounded
//! history buffer. One bus is built at startup and handed to every
//! component that publishes or listens.


use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default number of messages kept in history
pub const DEFAULT_HISTORY: usize = 1000;

/// Broadcast channel capacity per subscriber
const CHANNEL_CAPACITY: usize = 256;

/// Everything the daemon announces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    DaemonStarting,
    DaemonStarted {
        iteration: u64,
        schedule: String,
    },
    DaemonStopping {
        reason: String,
    },
    DaemonStopped {
        iterations: u64,
        uptime_secs: u64,
    },
    CycleStarted {
        iteration: u64,
    },
    CycleCompleted {
        iteration: u64,
        succeeded: u32,
        failed: u32,
        duration_ms: u64,
    },
    CycleFailed {
        iteration: u64,
        error: String,
    },
    MarketCreated {
        address: String,
        signature: String,
        question: String,
    },
    MarketCreationFailed {
        question: String,
        error: String,
    },
    NewsDetected {
        id: String,
        title: String,
        source: String,
        score: u8,
        category: String,
        urgency: String,
    },
    WebhookReceived {
        event_id: i64,
        event_type: String,
        signature: Option<String>,
    },
    Error {
        component: String,
        message: String,
    },
}

impl DaemonEvent {
    /// Tag used for history filtering, matches the serialized `type`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DaemonStarting => "daemon_starting",
            Self::DaemonStarted { .. } => "daemon_started",
            Self::DaemonStopping { .. } => "daemon_stopping",
            Self::DaemonStopped { .. } => "daemon_stopped",
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::MarketCreated { .. } => "market_created",
            Self::MarketCreationFailed { .. } => "market_creation_failed",
            Self::NewsDetected { .. } => "news_detected",
            Self::WebhookReceived { .. } => "webhook_received",
            Self::Error { .. } => "error",
        }
    }
}

/// Published event with its envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event: DaemonEvent,
}

struct BusInner {
    tx: broadcast::Sender<BusMessage>,
    history: Mutex<VecDeque<BusMessage>>,
    max_history: usize,
    next_id: AtomicU64,
}

/// Publish/subscribe hub with bounded history
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let max_history = max_history.max(1);
        Self {
            inner: Arc::new(BusInner {
                tx,
                history: Mutex::new(VecDeque::with_capacity(max_history.min(DEFAULT_HISTORY))),
                max_history,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Record and broadcast an event. Returns its id.
    pub fn publish(&self, event: DaemonEvent) -> u64 {
        let message = BusMessage {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            event,
        };
        let id = message.id;

        {
            let mut history = self.inner.history.lock();
            if history.len() >= self.inner.max_history {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        // No subscribers is fine, history still has it
        let _ = self.inner.tx.send(message);
        id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.inner.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Run `callback` for every message published from now on.
    ///
    /// The listener ends when the returned handle is aborted.
    pub fn spawn_listener<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => callback(&message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Most recent `limit` messages, oldest first
    pub fn history(&self, limit: usize) -> Vec<BusMessage> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Most recent `limit` messages of one kind, oldest first
    pub fn history_of(&self, kind: &str, limit: usize) -> Vec<BusMessage> {
        let history = self.inner.history.lock();
        let mut matching: Vec<BusMessage> = history
            .iter()
            .rev()
            .filter(|m| m.event.kind() == kind)
            .take(limit)
            .cloned()
            .collect();
        matching.reverse();
        matching
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }
}
