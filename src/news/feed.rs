//! Feed sources polled by the news monitor

use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// One entry as delivered by a feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedItem {
    pub id: Option<String>,
    pub link: Option<String>,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content: String,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Source name used in events and statistics
    fn name(&self) -> &str;

    /// Multiplier applied to every relevance score from this source
    fn trust_weight(&self) -> f64 {
        1.0
    }

    /// Extra keywords that earn a bonus for this source
    fn keywords(&self) -> Vec<String> {
        Vec::new()
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>>;
}

/// JSON Feed 1.1 document (https://jsonfeed.org/version/1.1)
#[derive(Debug, Deserialize)]
struct JsonFeedDocument {
    #[serde(default)]
    items: Vec<JsonFeedEntry>,
}

#[derive(Debug, Deserialize)]
struct JsonFeedEntry {
    id: Option<serde_json::Value>,
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content_text: Option<String>,
    #[serde(default)]
    content_html: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    date_published: Option<DateTime<Utc>>,
}

impl From<JsonFeedEntry> for FeedItem {
    fn from(entry: JsonFeedEntry) -> Self {
        let id = entry.id.and_then(|id| match id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let content = entry
            .content_text
            .or(entry.summary)
            .or(entry.content_html)
            .unwrap_or_default();

        FeedItem {
            id,
            link: entry.url,
            title: entry.title.unwrap_or_default(),
            published_at: entry.date_published,
            content,
        }
    }
}

/// Parse a JSON Feed body into items. Entries without a title are dropped.
pub fn parse_json_feed(body: &str) -> Result<Vec<FeedItem>> {
    let doc: JsonFeedDocument = serde_json::from_str(body)?;
    Ok(doc
        .items
        .into_iter()
        .map(FeedItem::from)
        .filter(|item| !item.title.trim().is_empty())
        .collect())
}

/// JSON Feed over HTTP
pub struct JsonFeedSource {
    http: Client,
    name: String,
    url: String,
    trust_weight: f64,
    keywords: Vec<String>,
}

impl JsonFeedSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        trust_weight: f64,
        keywords: Vec<String>,
    ) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            name: name.into(),
            url: url.into(),
            trust_weight,
            keywords,
        })
    }
}

#[async_trait]
impl FeedSource for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn trust_weight(&self) -> f64 {
        self.trust_weight
    }

    fn keywords(&self) -> Vec<String> {
        self.keywords.clone()
    }

    async fn fetch(&self) -> Result<Vec<FeedItem>> {
        let resp = self.http.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(DaemonError::ExternalService(format!(
                "feed {} returned {}",
                self.name,
                resp.status()
            )));
        }
        let body = resp.text().await?;
        let items = parse_json_feed(&body)?;
        debug!("Fetched {} items from {}", items.len(), self.name);
        Ok(items)
    }
}
