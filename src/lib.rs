//! Autonomous Market Creation Daemon
//!
//! Creates prediction markets on a schedule, persists what it produced, and
//! resumes where it left off after a restart.
//!
//! ## Architecture
//!
//! ```text
//! Schedule → Scheduler → Daemon cycle → MarketCreator → Database
//!                            ↑                            ↓
//!            NewsMonitor (feeds + scorer)            EventBus → subscribers
//!                                                         ↑
//!                          Webhook listener ──────────────┘
//! ```

pub mod config;
pub mod creator;
pub mod daemon;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod news;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod types;
pub mod webhook;
