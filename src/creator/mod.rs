//! Market creation service boundary
//!
//! The daemon only talks to [`MarketCreator`]. Two implementations ship:
//! [`DryRunCreator`] fabricates ids locally, [`HttpMarketCreator`] posts the
//! request as JSON to a configured endpoint.

pub mod questions;

pub use questions::{MarketProposal, QuestionSource, TemplateQuestionSource};

use crate::error::{DaemonError, Result};
use crate::types::{MarketCategory, TokenAmount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Parameters for one market creation call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateMarketRequest {
    pub question: String,
    pub category: MarketCategory,
    pub duration_days: u32,
    pub end_time: DateTime<Utc>,
    pub initial_liquidity: TokenAmount,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Result of a successful creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedMarket {
    /// Transaction signature
    pub signature: String,
    /// Address of the new market
    #[serde(alias = "marketId", alias = "address")]
    pub market_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketCreator: Send + Sync {
    async fn create_market(&self, request: &CreateMarketRequest) -> Result<CreatedMarket>;
}

/// Creator that never leaves the process
#[derive(Debug, Default)]
pub struct DryRunCreator {
    created: AtomicU64,
}

impl DryRunCreator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketCreator for DryRunCreator {
    async fn create_market(&self, request: &CreateMarketRequest) -> Result<CreatedMarket> {
        let n = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let id = uuid::Uuid::new_v4().simple().to_string();
        info!("[DRY RUN] Would create market #{}: {}", n, request.question);
        Ok(CreatedMarket {
            signature: format!("dryrun-sig-{}", id),
            market_id: format!("dryrun-{}", id),
        })
    }
}

/// Posts creation requests to an HTTP service
pub struct HttpMarketCreator {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpMarketCreator {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        if endpoint.trim().is_empty() {
            return Err(DaemonError::Config("creator endpoint is empty".into()));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl MarketCreator for HttpMarketCreator {
    async fn create_market(&self, request: &CreateMarketRequest) -> Result<CreatedMarket> {
        let mut req = self.http.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DaemonError::ExternalService(format!(
                "market creation failed ({}): {}",
                status, body
            )));
        }

        let created: CreatedMarket = resp.json().await?;
        debug!("Market created at {} ({})", created.market_id, created.signature);
        Ok(created)
    }
}
