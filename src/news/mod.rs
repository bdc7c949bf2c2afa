//! News monitor
//!
//! Polls feed sources on a fixed interval, scores each unseen item and
//! keeps the relevant ones in a bounded ring buffer. Kept items are also
//! published on the event bus as `news_detected`.
//!
//! Fetch failures are counted per source and logged. They never stop the
//! monitor.

pub mod feed;
pub mod scorer;


pub use feed::{FeedItem, FeedSource, JsonFeedSource};
pub use scorer::{score_relevance, Relevance, Urgency};

use crate::events::{DaemonEvent, EventBus};
use crate::types::MarketCategory;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Items scoring below this are dropped
pub const DEFAULT_MIN_SCORE: u8 = 30;

/// Dedup ids remembered before the oldest half is forgotten
pub const MAX_SEEN_IDS: usize = 10_000;

const SNIPPET_CHARS: usize = 280;

/// A scored, relevant news item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub relevance_score: u8,
    pub matched_keywords: Vec<String>,
    pub suggested_category: MarketCategory,
    pub urgency: Urgency,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct NewsMonitorConfig {
    pub poll_interval: Duration,
    /// Ring buffer size
    pub buffer_size: usize,
    pub min_score: u8,
    pub seen_capacity: usize,
}

impl Default for NewsMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            buffer_size: 100,
            min_score: DEFAULT_MIN_SCORE,
            seen_capacity: MAX_SEEN_IDS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub fetches: u64,
    pub failures: u64,
    pub items_seen: u64,
    pub events_kept: u64,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub polls: u64,
    pub events_detected: u64,
    pub buffered: usize,
    pub seen_ids: usize,
    pub sources: BTreeMap<String, SourceStats>,
}

/// Stable dedup key: feed id, else link, else SHA-256 of the title
pub fn dedup_id(item: &FeedItem) -> String {
    if let Some(id) = item.id.as_deref().filter(|s| !s.trim().is_empty()) {
        return id.to_string();
    }
    if let Some(link) = item.link.as_deref().filter(|s| !s.trim().is_empty()) {
        return link.to_string();
    }
    hex::encode(Sha256::digest(item.title.trim().as_bytes()))
}

#[derive(Default)]
struct MonitorState {
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    buffer: VecDeque<NewsEvent>,
    stats: MonitorStats,
}

impl MonitorState {
    /// Returns false when the id was already seen
    fn remember(&mut self, id: &str, capacity: usize) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.seen.len() >= capacity {
            let evict = (capacity / 2).max(1);
            for old in self.seen_order.drain(..evict.min(self.seen_order.len())) {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(id.to_string());
        self.seen_order.push_back(id.to_string());
        true
    }
}

struct PollTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct MonitorInner {
    sources: Vec<Arc<dyn FeedSource>>,
    bus: EventBus,
    config: NewsMonitorConfig,
    state: Mutex<MonitorState>,
    task: Mutex<Option<PollTask>>,
}

/// Feed poller with a bounded buffer of relevant items
#[derive(Clone)]
pub struct NewsMonitor {
    inner: Arc<MonitorInner>,
}

impl NewsMonitor {
    pub fn new(sources: Vec<Arc<dyn FeedSource>>, bus: EventBus, config: NewsMonitorConfig) -> Self {
        let mut state = MonitorState::default();
        for source in &sources {
            state
                .stats
                .sources
                .insert(source.name().to_string(), SourceStats::default());
        }
        Self {
            inner: Arc::new(MonitorInner {
                sources,
                bus,
                config,
                state: Mutex::new(state),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.lock().is_some()
    }

    /// Spawn the poll loop. The first poll happens immediately.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let monitor = self.clone();
        let interval = self.inner.config.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.poll_once() => {}
                    _ = rx.changed() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = rx.changed() => break,
                }
            }
            debug!("News poll loop exited");
        });

        *task = Some(PollTask { cancel: tx, handle });
        info!(
            "News monitor started: {} source(s), every {:?}",
            self.inner.sources.len(),
            interval
        );
    }

    /// Stop polling and wait for the loop to exit
    pub async fn stop(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            let _ = task.handle.await;
            info!("News monitor stopped");
        }
    }

    /// Fetch every source once. Returns the number of new relevant events.
    pub async fn poll_once(&self) -> usize {
        let mut kept = 0;
        for source in &self.inner.sources {
            let name = source.name().to_string();
            match source.fetch().await {
                Ok(items) => {
                    kept += self.ingest(source.as_ref(), items).len();
                }
                Err(e) => {
                    warn!("Feed {} failed: {}", name, e);
                    let mut state = self.inner.state.lock();
                    let stats = state.stats.sources.entry(name).or_default();
                    stats.fetches += 1;
                    stats.failures += 1;
                    stats.last_fetch = Some(Utc::now());
                    stats.last_error = Some(e.to_string());
                }
            }
        }
        self.inner.state.lock().stats.polls += 1;
        kept
    }

    /// Score and buffer a batch of items from `source`. Returns the kept events.
    pub fn ingest(&self, source: &dyn FeedSource, items: Vec<FeedItem>) -> Vec<NewsEvent> {
        let keywords = source.keywords();
        let trust = source.trust_weight();
        let config = &self.inner.config;
        let item_count = items.len() as u64;
        let mut kept = Vec::new();

        {
            let mut state = self.inner.state.lock();
            for item in items {
                let id = dedup_id(&item);
                if !state.remember(&id, config.seen_capacity) {
                    continue;
                }

                let text = format!("{} {}", item.title, item.content);
                let relevance = score_relevance(&text, &keywords, trust);
                if relevance.score < config.min_score {
                    continue;
                }

                let event = NewsEvent {
                    id,
                    title: item.title,
                    link: item.link,
                    source: source.name().to_string(),
                    published_at: item.published_at.unwrap_or_else(Utc::now),
                    relevance_score: relevance.score,
                    matched_keywords: relevance.matched_keywords,
                    suggested_category: relevance.category,
                    urgency: relevance.urgency,
                    snippet: item.content.chars().take(SNIPPET_CHARS).collect(),
                };

                if state.buffer.len() >= config.buffer_size.max(1) {
                    state.buffer.pop_front();
                }
                state.buffer.push_back(event.clone());
                kept.push(event);
            }

            state.stats.events_detected += kept.len() as u64;
            let stats = state.stats.sources.entry(source.name().to_string()).or_default();
            stats.fetches += 1;
            stats.items_seen += item_count;
            stats.events_kept += kept.len() as u64;
            stats.last_fetch = Some(Utc::now());
            stats.last_error = None;
        }

        for event in &kept {
            self.inner.bus.publish(DaemonEvent::NewsDetected {
                id: event.id.clone(),
                title: event.title.clone(),
                source: event.source.clone(),
                score: event.relevance_score,
                category: event.suggested_category.key().to_string(),
                urgency: event.urgency.to_string(),
            });
        }
        if !kept.is_empty() {
            debug!("{} relevant item(s) from {}", kept.len(), source.name());
        }
        kept
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<NewsEvent> {
        self.inner
            .state
            .lock()
            .buffer
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: MarketCategory, limit: usize) -> Vec<NewsEvent> {
        self.filtered(limit, |e| e.suggested_category == category)
    }

    pub fn by_urgency(&self, urgency: Urgency, limit: usize) -> Vec<NewsEvent> {
        self.filtered(limit, |e| e.urgency == urgency)
    }

    fn filtered(&self, limit: usize, pred: impl Fn(&NewsEvent) -> bool) -> Vec<NewsEvent> {
        self.inner
            .state
            .lock()
            .buffer
            .iter()
            .rev()
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.buffered = state.buffer.len();
        stats.seen_ids = state.seen.len();
        stats
    }
}
