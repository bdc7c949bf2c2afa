//! Core domain types shared across the daemon

use crate::error::DaemonError;
use chrono::{DateTime, Duration, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 86_400_000;

/// Longest market duration accepted from config (100 years)
pub const MAX_DURATION_DAYS: u32 = 36_500;

/// Unsigned token quantity (lamports, base units).
///
/// Always serialized as a decimal string so that values above 2^53 survive
/// JSON and SQLite round trips untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    /// Exact sum, or an error when it does not fit in 128 bits
    pub fn try_add(self, other: TokenAmount) -> Result<TokenAmount, DaemonError> {
        self.checked_add(other).ok_or_else(|| {
            DaemonError::Persistence(format!("token amount overflow: {} + {}", self, other))
        })
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(TokenAmount)
            .map_err(|e| DaemonError::Persistence(format!("invalid token amount '{}': {}", s, e)))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl de::Visitor<'_> for AmountVisitor {
            type Value = TokenAmount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or decimal string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TokenAmount, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TokenAmount, E> {
                Ok(TokenAmount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TokenAmount, E> {
                u64::try_from(v)
                    .map(TokenAmount::from)
                    .map_err(|_| E::custom("token amount cannot be negative"))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Market lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    #[default]
    Active,
    Resolved,
    Cancelled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketStatus {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(DaemonError::Persistence(format!("unknown market status '{}'", other))),
        }
    }
}

/// The fixed set of market categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketCategory {
    #[default]
    Crypto,
    Technology,
    Politics,
    Economy,
}

impl MarketCategory {
    pub const ALL: [MarketCategory; 4] = [
        MarketCategory::Crypto,
        MarketCategory::Technology,
        MarketCategory::Politics,
        MarketCategory::Economy,
    ];

    /// Stable machine key
    pub fn key(&self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::Technology => "technology",
            Self::Politics => "politics",
            Self::Economy => "economy",
        }
    }

    /// Display label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Crypto => "Crypto & DeFi",
            Self::Technology => "Technology",
            Self::Politics => "Politics & Regulation",
            Self::Economy => "Economy & Markets",
        }
    }
}

impl FromStr for MarketCategory {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        MarketCategory::ALL
            .into_iter()
            .find(|c| c.key().eq_ignore_ascii_case(wanted) || c.label().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DaemonError::Config(format!("unknown market category '{}'", s)))
    }
}

/// A created market as tracked by the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// On-chain market address (unique key)
    pub address: String,
    pub question: String,
    /// Human readable category label
    pub category: String,
    /// Stable category key
    pub category_key: String,
    pub created_at: DateTime<Utc>,
    /// Transaction signature of the creation call
    #[serde(default)]
    pub creation_signature: Option<String>,
    pub initial_liquidity: TokenAmount,
    pub duration_days: u32,
    /// Derived from `created_at + duration_days` when not supplied
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MarketStatus,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub volume: Option<TokenAmount>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Market {
    /// New active market created now
    pub fn new(
        address: impl Into<String>,
        question: impl Into<String>,
        category: MarketCategory,
        duration_days: u32,
        initial_liquidity: TokenAmount,
    ) -> Self {
        Self {
            address: address.into(),
            question: question.into(),
            category: category.label().to_string(),
            category_key: category.key().to_string(),
            created_at: Utc::now(),
            creation_signature: None,
            initial_liquidity,
            duration_days,
            end_time: None,
            status: MarketStatus::Active,
            outcome: None,
            volume: None,
            resolved_at: None,
            metadata: empty_metadata(),
        }
    }

    /// `created_at + duration_days`
    pub fn computed_end_time(&self) -> Result<DateTime<Utc>, DaemonError> {
        end_time_after(self.created_at, self.duration_days)
    }

    /// Explicit end time if present, otherwise the derived one
    pub fn effective_end_time(&self) -> Result<DateTime<Utc>, DaemonError> {
        match self.end_time {
            Some(end) => Ok(end),
            None => self.computed_end_time(),
        }
    }
}

/// Durable checkpoint needed to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DaemonState {
    pub iteration_count: u64,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Snapshot of the active run configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Event delivered by the inbound webhook listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundWebhook {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Row of the append-only inbound event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: i64,
    pub event_type: String,
    pub signature: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

/// `start + duration_days`, failing instead of overflowing the calendar
pub fn end_time_after(start: DateTime<Utc>, duration_days: u32) -> Result<DateTime<Utc>, DaemonError> {
    start
        .checked_add_signed(Duration::milliseconds(i64::from(duration_days) * DAY_MS))
        .ok_or_else(|| {
            DaemonError::Persistence(format!(
                "duration of {} days overflows the end time",
                duration_days
            ))
        })
}

/// Convert stored epoch milliseconds back into a timestamp
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
