//! Keyword relevance scoring for news items
//!
//! Pure functions, no I/O. Matching is case-insensitive substring search.

use crate::types::MarketCategory;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Points per unit of lexicon weight
const WEIGHT_POINTS: u32 = 10;

/// Points per source-specific keyword hit
const SOURCE_KEYWORD_BONUS: u32 = 10;

/// Weighted lexicon of market-worthy terms
const LEXICON: &[(&str, u32)] = &[
    ("bitcoin", 3),
    ("ethereum", 3),
    ("solana", 3),
    ("crypto", 2),
    ("blockchain", 2),
    ("defi", 2),
    ("stablecoin", 2),
    ("token", 1),
    ("mainnet", 2),
    ("airdrop", 2),
    ("etf", 3),
    ("exploit", 3),
    ("hack", 3),
    ("zero-knowledge", 2),
    ("artificial intelligence", 2),
    ("openai", 2),
    ("launch", 1),
    ("upgrade", 1),
    ("regulation", 2),
    ("lawsuit", 2),
    ("election", 2),
    ("congress", 1),
    ("federal reserve", 3),
    ("interest rate", 2),
    ("inflation", 2),
    ("recession", 2),
];

const CATEGORY_KEYWORDS: &[(MarketCategory, &[&str])] = &[
    (
        MarketCategory::Crypto,
        &[
            "bitcoin", "ethereum", "solana", "crypto", "blockchain", "defi", "token", "nft",
            "stablecoin", "airdrop", "wallet", "mainnet",
        ],
    ),
    (
        MarketCategory::Technology,
        &[
            "artificial intelligence", "openai", "software", "chip", "semiconductor", "apple",
            "google", "microsoft", "startup", "zero-knowledge",
        ],
    ),
    (
        MarketCategory::Politics,
        &[
            "election", "congress", "senate", "regulation", "regulator", "lawsuit", "president",
            "government", "bill", "court",
        ],
    ),
    (
        MarketCategory::Economy,
        &[
            "federal reserve", "interest rate", "inflation", "recession", "gdp", "unemployment",
            "stock market", "treasury", "tariff",
        ],
    ),
];

const BREAKING_INDICATORS: &[&str] = &["breaking", "urgent", "just in", "alert", "exploit", "hack"];

const TIMELY_INDICATORS: &[&str] = &[
    "announce",
    "launch",
    "today",
    "this week",
    "upcoming",
    "scheduled",
    "release",
];

/// How soon a story is likely to matter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Breaking,
    Timely,
    Evergreen,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Breaking => "breaking",
            Urgency::Timely => "timely",
            Urgency::Evergreen => "evergreen",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of scoring one piece of text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relevance {
    /// 0-100
    pub score: u8,
    pub matched_keywords: Vec<String>,
    pub category: MarketCategory,
    pub urgency: Urgency,
}

/// Score `text` against the lexicon plus the source's own keywords.
///
/// `trust_weight` scales the raw score before clamping to 0-100.
pub fn score_relevance(text: &str, source_keywords: &[String], trust_weight: f64) -> Relevance {
    let lower = text.to_lowercase();

    let mut raw = 0u32;
    let mut matched = Vec::new();
    for (keyword, weight) in LEXICON {
        if lower.contains(keyword) {
            raw += weight * WEIGHT_POINTS;
            matched.push((*keyword).to_string());
        }
    }
    for keyword in source_keywords {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() && lower.contains(&keyword) {
            raw += SOURCE_KEYWORD_BONUS;
            if !matched.contains(&keyword) {
                matched.push(keyword);
            }
        }
    }

    let weighted = f64::from(raw) * trust_weight.max(0.0);
    let score = weighted.round().clamp(0.0, 100.0) as u8;

    Relevance {
        score,
        matched_keywords: matched,
        category: classify(&lower),
        urgency: urgency(&lower),
    }
}

/// Category with the most keyword hits. Ties go to the default category.
pub fn classify(text: &str) -> MarketCategory {
    let lower = text.to_lowercase();
    let mut best = MarketCategory::default();
    let mut best_hits = 0usize;

    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits = keywords.iter().filter(|k| lower.contains(*k)).count();
        if hits > best_hits {
            best = *category;
            best_hits = hits;
        }
    }

    // A tie with the leader is not a win
    let leaders = CATEGORY_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().filter(|k| lower.contains(*k)).count() == best_hits)
        .count();
    if best_hits == 0 || leaders > 1 {
        MarketCategory::default()
    } else {
        best
    }
}

/// Breaking wins over timely
pub fn urgency(text: &str) -> Urgency {
    let lower = text.to_lowercase();
    if BREAKING_INDICATORS.iter().any(|k| lower.contains(k)) {
        Urgency::Breaking
    } else if TIMELY_INDICATORS.iter().any(|k| lower.contains(k)) {
        Urgency::Timely
    } else {
        Urgency::Evergreen
    }
}
