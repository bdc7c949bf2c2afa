//! Daemon orchestrator
//!
//! Owns every long-lived component and drives the market cycle:
//!
//! ```text
//! Scheduler ─▶ execute_cycle ─▶ QuestionSource ─▶ MarketCreator ─▶ Database
//!                   ▲                                                  │
//!              NewsMonitor                                   EventBus ◀┘
//! ```
//!
//! Phases: `Created -> Starting -> Running -> Stopping -> Stopped`. A daemon
//! is started at most once; `Stopped` is terminal.


use crate::config::Config;
use crate::creator::{
    CreateMarketRequest, DryRunCreator, HttpMarketCreator, MarketCreator, QuestionSource,
    TemplateQuestionSource,
};
use crate::error::{DaemonError, Result};
use crate::events::{DaemonEvent, EventBus};
use crate::lifecycle::{self, LifecycleController, ShutdownReason};
use crate::news::{FeedSource, JsonFeedSource, NewsEvent, NewsMonitor, NewsMonitorConfig};
use crate::scheduler::{Scheduler, TaskSnapshot, TaskSpec};
use crate::storage::Database;
use crate::types::{end_time_after, DaemonState, InboundEvent, InboundWebhook, Market};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name of the scheduler task that runs market cycles
pub const CYCLE_TASK: &str = "market-cycle";

const INBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonPhase {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Point-in-time view for status displays
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub phase: DaemonPhase,
    pub iteration_count: u64,
    pub uptime_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub schedule: String,
    pub dry_run: bool,
    pub config: serde_json::Value,
    pub tasks: Vec<TaskSnapshot>,
}

/// Outcome of one cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub iteration: u64,
    pub succeeded: u32,
    pub failed: u32,
    pub duration_ms: u64,
    /// Addresses of the markets created, in creation order
    pub created: Vec<String>,
}

/// Assembles a [`Daemon`], defaulting collaborators from the config
pub struct DaemonBuilder {
    config: Config,
    bus: Option<EventBus>,
    creator: Option<Arc<dyn MarketCreator>>,
    questions: Option<Arc<dyn QuestionSource>>,
    feed_sources: Option<Vec<Arc<dyn FeedSource>>>,
}

impl DaemonBuilder {
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn creator(mut self, creator: Arc<dyn MarketCreator>) -> Self {
        self.creator = Some(creator);
        self
    }

    pub fn question_source(mut self, questions: Arc<dyn QuestionSource>) -> Self {
        self.questions = Some(questions);
        self
    }

    pub fn feed_sources(mut self, sources: Vec<Arc<dyn FeedSource>>) -> Self {
        self.feed_sources = Some(sources);
        self
    }

    pub fn build(self) -> Result<Daemon> {
        let config = self.config;
        config.validate()?;

        let creator: Arc<dyn MarketCreator> = match self.creator {
            Some(creator) => creator,
            None if config.daemon.dry_run => Arc::new(DryRunCreator::new()),
            None => {
                let endpoint = config.creator.endpoint.as_deref().unwrap_or_default();
                Arc::new(HttpMarketCreator::new(
                    endpoint,
                    config.creator.api_key.clone(),
                    Duration::from_secs(config.creator.timeout_secs),
                )?)
            }
        };

        let feed_sources = match self.feed_sources {
            Some(sources) => sources,
            None => config
                .news
                .sources
                .iter()
                .map(|s| {
                    JsonFeedSource::new(&s.name, &s.url, s.trust_weight, s.keywords.clone())
                        .map(|source| Arc::new(source) as Arc<dyn FeedSource>)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let questions = self
            .questions
            .unwrap_or_else(|| Arc::new(TemplateQuestionSource::new(config.daemon.duration_days)));
        let bus = self.bus.unwrap_or_default();
        let lifecycle = LifecycleController::new(bus.clone(), config.shutdown_timeout());

        Ok(Daemon {
            inner: Arc::new(DaemonInner {
                config,
                bus,
                creator,
                questions,
                feed_sources,
                scheduler: Scheduler::new(),
                lifecycle,
                phase: Mutex::new(DaemonPhase::Created),
                iteration: AtomicU64::new(0),
                last_run: Mutex::new(None),
                started: Mutex::new(None),
                store: RwLock::new(None),
                news: Mutex::new(None),
                webhook: Mutex::new(None),
                forwarder: Mutex::new(None),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

struct DaemonInner {
    config: Config,
    bus: EventBus,
    creator: Arc<dyn MarketCreator>,
    questions: Arc<dyn QuestionSource>,
    feed_sources: Vec<Arc<dyn FeedSource>>,
    scheduler: Scheduler,
    lifecycle: LifecycleController,
    phase: Mutex<DaemonPhase>,
    iteration: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
    started: Mutex<Option<(Instant, DateTime<Utc>)>>,
    store: RwLock<Option<Database>>,
    news: Mutex<Option<NewsMonitor>>,
    webhook: Mutex<Option<crate::webhook::WebhookListener>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Held for the duration of a cycle
    cycle_lock: tokio::sync::Mutex<()>,
}

/// Cheap to clone handle to the daemon
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    pub fn builder(config: Config) -> DaemonBuilder {
        DaemonBuilder {
            config,
            bus: None,
            creator: None,
            questions: None,
            feed_sources: None,
        }
    }

    /// Daemon with every collaborator taken from the config
    pub fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.inner.lifecycle
    }

    pub fn phase(&self) -> DaemonPhase {
        *self.inner.phase.lock()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == DaemonPhase::Running
    }

    pub fn iteration_count(&self) -> u64 {
        self.inner.iteration.load(Ordering::SeqCst)
    }

    pub fn news(&self) -> Option<NewsMonitor> {
        self.inner.news.lock().clone()
    }

    pub fn webhook_addr(&self) -> Option<SocketAddr> {
        self.inner.webhook.lock().as_ref().map(|w| w.local_addr())
    }

    /// The open record store
    pub fn database(&self) -> Result<Database> {
        self.inner.store.read().clone().ok_or(DaemonError::StoreClosed)
    }

    fn weak(&self) -> Weak<DaemonInner> {
        Arc::downgrade(&self.inner)
    }

    fn set_phase(&self, phase: DaemonPhase) {
        *self.inner.phase.lock() = phase;
    }

    /// Open the store, restore state, start the background components and
    /// the scheduler. Fails unless the daemon is freshly created.
    pub async fn start(&self) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock();
            if *phase != DaemonPhase::Created {
                return Err(DaemonError::InvalidState(format!(
                    "cannot start a daemon that is {:?}",
                    *phase
                )));
            }
            *phase = DaemonPhase::Starting;
        }

        self.inner.bus.publish(DaemonEvent::DaemonStarting);

        if let Err(e) = self.start_components().await {
            error!("Daemon failed to start: {}", e);
            self.teardown().await;
            self.set_phase(DaemonPhase::Stopped);
            return Err(e);
        }

        self.set_phase(DaemonPhase::Running);
        let schedule = self.inner.config.daemon.schedule.clone();
        info!(
            "Daemon running (iteration {}, schedule {}, dry_run {})",
            self.iteration_count(),
            schedule,
            self.inner.config.daemon.dry_run
        );
        self.inner.bus.publish(DaemonEvent::DaemonStarted {
            iteration: self.iteration_count(),
            schedule,
        });

        self.inner.scheduler.start().await
    }

    async fn start_components(&self) -> Result<()> {
        let config = &self.inner.config;

        let db = Database::connect_with(&config.database.path, config.database.max_connections).await?;
        if let Some(state) = db.get_state().await? {
            // Never move the counter backwards
            self.inner.iteration.fetch_max(state.iteration_count, Ordering::SeqCst);
            *self.inner.last_run.lock() = state.last_run;
            info!("Restored daemon state at iteration {}", state.iteration_count);
        }
        *self.inner.store.write() = Some(db);
        *self.inner.started.lock() = Some((Instant::now(), Utc::now()));

        if config.news.enabled && !self.inner.feed_sources.is_empty() {
            let monitor = NewsMonitor::new(
                self.inner.feed_sources.clone(),
                self.inner.bus.clone(),
                NewsMonitorConfig {
                    poll_interval: Duration::from_secs(config.news.poll_interval_secs),
                    buffer_size: config.news.buffer_size,
                    min_score: config.news.min_score,
                    ..Default::default()
                },
            );
            monitor.start();
            *self.inner.news.lock() = Some(monitor);
        } else if config.news.enabled {
            warn!("News monitoring enabled but no sources configured");
        }

        if config.webhook.enabled {
            let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
            let listener = crate::webhook::WebhookListener::bind(
                &config.webhook.bind,
                config.webhook.bearer_token.clone(),
                tx,
            )
            .await?;
            *self.inner.webhook.lock() = Some(listener);
            *self.inner.forwarder.lock() = Some(spawn_forwarder(self.weak(), rx));
        }

        self.inner.scheduler.add_task(self.cycle_task())?;
        Ok(())
    }

    fn cycle_task(&self) -> TaskSpec {
        let weak = self.weak();
        TaskSpec::new(CYCLE_TASK, self.inner.config.daemon.schedule.clone(), move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                Daemon { inner }.execute_cycle().await.map(|_| ())
            }
        })
        .run_immediately(self.inner.config.daemon.run_on_start)
    }

    /// Run one market cycle.
    ///
    /// Returns `Ok(None)` when the iteration limit was already reached, in
    /// which case the daemon shuts itself down.
    pub async fn execute_cycle(&self) -> Result<Option<CycleReport>> {
        if !self.is_running() {
            return Err(DaemonError::InvalidState("daemon is not running".into()));
        }

        if let Some(max) = self.inner.config.daemon.max_iterations {
            if self.iteration_count() >= max {
                info!("Reached max iterations ({}), stopping", max);
                self.shutdown(ShutdownReason::Requested(format!(
                    "max iterations reached ({})",
                    max
                )))
                .await;
                return Ok(None);
            }
        }

        let _cycle = self.inner.cycle_lock.lock().await;
        // stop() may have begun while we waited
        if !self.is_running() {
            return Ok(None);
        }

        let iteration = self.inner.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        self.inner.bus.publish(DaemonEvent::CycleStarted { iteration });
        info!("Cycle {} started", iteration);

        match self.run_cycle(iteration, started).await {
            Ok(report) => {
                info!(
                    "Cycle {} completed: {} created, {} failed in {}ms",
                    iteration, report.succeeded, report.failed, report.duration_ms
                );
                self.inner.bus.publish(DaemonEvent::CycleCompleted {
                    iteration,
                    succeeded: report.succeeded,
                    failed: report.failed,
                    duration_ms: report.duration_ms,
                });
                Ok(Some(report))
            }
            Err(e) => {
                error!("Cycle {} failed: {}", iteration, e);
                self.inner.bus.publish(DaemonEvent::CycleFailed {
                    iteration,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, iteration: u64, started: Instant) -> Result<CycleReport> {
        let config = &self.inner.config.daemon;
        let store = self.database()?;

        let news: Vec<NewsEvent> = self
            .news()
            .map(|m| m.recent(config.news_context_limit))
            .unwrap_or_default();
        let requested = config.markets_per_round as usize;
        let mut proposals = self.inner.questions.propose(requested, iteration, &news);
        proposals.truncate(requested);
        debug!(
            "Cycle {}: {} proposal(s) from {} news item(s)",
            iteration,
            proposals.len(),
            news.len()
        );

        let mut succeeded = 0u32;
        let mut failed = 0u32;
        let mut created = Vec::new();

        let shortfall = requested - proposals.len();
        if shortfall > 0 {
            failed += shortfall as u32;
            warn!(
                "Cycle {}: only {} of {} question(s) available",
                iteration,
                proposals.len(),
                requested
            );
            self.inner.bus.publish(DaemonEvent::Error {
                component: "questions".into(),
                message: format!("{} of {} question(s) could not be generated", shortfall, requested),
            });
        }

        for (i, proposal) in proposals.into_iter().enumerate() {
            if i > 0 && config.pacing_ms > 0 {
                tokio::time::sleep(config.pacing()).await;
            }

            let duration_days = proposal.duration_days.unwrap_or(config.duration_days);
            let created_at = Utc::now();
            let end_time = match end_time_after(created_at, duration_days) {
                Ok(end_time) => end_time,
                Err(e) => {
                    failed += 1;
                    warn!("Skipping '{}': {}", proposal.question, e);
                    self.inner.bus.publish(DaemonEvent::MarketCreationFailed {
                        question: proposal.question,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let request = CreateMarketRequest {
                question: proposal.question.clone(),
                category: proposal.category,
                duration_days,
                end_time,
                initial_liquidity: config.initial_liquidity,
                metadata: serde_json::json!({
                    "iteration": iteration,
                    "source_news_id": proposal.source_news_id,
                }),
            };

            let result = match self.inner.creator.create_market(&request).await {
                Ok(market) => {
                    let mut record = Market::new(
                        market.market_id,
                        request.question.clone(),
                        request.category,
                        duration_days,
                        request.initial_liquidity,
                    );
                    record.created_at = created_at;
                    record.creation_signature = Some(market.signature.clone());
                    record.metadata = request.metadata.clone();
                    store.save_market(&record).await.map(|saved| (saved, market.signature))
                }
                Err(e) => Err(e),
            };

            match result {
                Ok((saved, signature)) => {
                    succeeded += 1;
                    info!("Created market {}: {}", saved.address, saved.question);
                    self.inner.bus.publish(DaemonEvent::MarketCreated {
                        address: saved.address.clone(),
                        signature,
                        question: saved.question,
                    });
                    created.push(saved.address);
                }
                Err(e) => {
                    failed += 1;
                    warn!("Market creation failed for '{}': {}", request.question, e);
                    self.inner.bus.publish(DaemonEvent::MarketCreationFailed {
                        question: request.question,
                        error: e.to_string(),
                    });
                }
            }
        }

        *self.inner.last_run.lock() = Some(Utc::now());
        store.save_state(&self.state_snapshot()).await?;

        Ok(CycleReport {
            iteration,
            succeeded,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
            created,
        })
    }

    fn state_snapshot(&self) -> DaemonState {
        DaemonState {
            iteration_count: self.iteration_count(),
            last_run: *self.inner.last_run.lock(),
            config: serde_json::to_value(&self.inner.config).unwrap_or_default(),
        }
    }

    /// Stop everything and persist final state. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                DaemonPhase::Stopping | DaemonPhase::Stopped => return Ok(()),
                DaemonPhase::Created => {
                    *phase = DaemonPhase::Stopped;
                    return Ok(());
                }
                DaemonPhase::Starting | DaemonPhase::Running => *phase = DaemonPhase::Stopping,
            }
        }
        info!("Daemon stopping");

        let result = self.teardown().await;

        self.set_phase(DaemonPhase::Stopped);
        let uptime_secs = self.uptime().as_secs();
        self.inner.bus.publish(DaemonEvent::DaemonStopped {
            iterations: self.iteration_count(),
            uptime_secs,
        });
        info!(
            "Daemon stopped after {} iteration(s), up {}s",
            self.iteration_count(),
            uptime_secs
        );
        result
    }

    /// Stop components, wait for an in-flight cycle, save state, close the store
    async fn teardown(&self) -> Result<()> {
        self.inner.scheduler.stop();

        let news = self.inner.news.lock().take();
        if let Some(news) = news {
            news.stop().await;
        }
        let listener = self.inner.webhook.lock().take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
        if let Some(forwarder) = self.inner.forwarder.lock().take() {
            forwarder.abort();
        }

        let _cycle = self.inner.cycle_lock.lock().await;

        let store = self.inner.store.write().take();
        let Some(store) = store else {
            return Ok(());
        };
        let saved = store.save_state(&self.state_snapshot()).await;
        if let Err(e) = &saved {
            error!("Failed to persist final state: {}", e);
        }
        store.close().await;
        saved
    }

    /// Run the lifecycle shutdown sequence. `None` if one is already running.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Option<i32> {
        self.inner.lifecycle.shutdown(reason, || self.stop()).await
    }

    /// Wait for a signal, a panic or a self-initiated stop. Returns the exit code.
    pub async fn supervise(&self) -> i32 {
        let (tx, mut rx) = mpsc::unbounded_channel();
        lifecycle::install_panic_hook(tx);

        let reason = tokio::select! {
            reason = lifecycle::wait_for_signal() => reason,
            Some(reason) = rx.recv() => reason,
            code = self.inner.lifecycle.finished() => return code,
        };

        match self.shutdown(reason).await {
            Some(code) => code,
            None => self.inner.lifecycle.finished().await,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.inner
            .started
            .lock()
            .map(|(at, _)| at.elapsed())
            .unwrap_or_default()
    }

    /// Side-effect free snapshot
    pub fn status(&self) -> DaemonStatus {
        let started_at = self.inner.started.lock().map(|(_, at)| at);
        DaemonStatus {
            running: self.is_running(),
            phase: self.phase(),
            iteration_count: self.iteration_count(),
            uptime_secs: self.uptime().as_secs(),
            started_at,
            last_run: *self.inner.last_run.lock(),
            schedule: self.inner.config.daemon.schedule.clone(),
            dry_run: self.inner.config.daemon.dry_run,
            config: serde_json::to_value(&self.inner.config).unwrap_or_default(),
            tasks: self.inner.scheduler.get_all_tasks(),
        }
    }

    /// Record an inbound webhook event and announce it
    pub async fn handle_inbound(&self, event: InboundWebhook) -> Result<InboundEvent> {
        let store = self.database()?;
        let saved = store.save_inbound_event(&event).await?;
        self.inner.bus.publish(DaemonEvent::WebhookReceived {
            event_id: saved.id,
            event_type: saved.event_type.clone(),
            signature: saved.signature.clone(),
        });
        Ok(saved)
    }
}

fn spawn_forwarder(weak: Weak<DaemonInner>, mut rx: mpsc::Receiver<InboundWebhook>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let daemon = Daemon { inner };
            if let Err(e) = daemon.handle_inbound(event).await {
                warn!("Dropping inbound event: {}", e);
                daemon.inner.bus.publish(DaemonEvent::Error {
                    component: "webhook".into(),
                    message: e.to_string(),
                });
            }
        }
    })
}
