//! Question generation
//!
//! Turns recent news into market questions, topping up with evergreen
//! templates when there is not enough news.

use crate::news::{NewsEvent, Urgency};
use crate::types::{end_time_after, MarketCategory, MAX_DURATION_DAYS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// A market the daemon intends to create
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketProposal {
    pub question: String,
    pub category: MarketCategory,
    /// Overrides the configured duration when set
    pub duration_days: Option<u32>,
    /// News item that inspired the question
    pub source_news_id: Option<String>,
}

pub trait QuestionSource: Send + Sync {
    /// Up to `count` distinct proposals for this cycle.
    ///
    /// The daemon counts any shortfall as failed items.
    fn propose(&self, count: usize, iteration: u64, news: &[NewsEvent]) -> Vec<MarketProposal>;
}

const EVERGREEN: &[(MarketCategory, &str)] = &[
    (MarketCategory::Crypto, "Will Bitcoin trade above its current price on {date}?"),
    (MarketCategory::Crypto, "Will Solana's daily transaction count set a new record before {date}?"),
    (MarketCategory::Technology, "Will a major AI lab release a new flagship model before {date}?"),
    (MarketCategory::Economy, "Will the Federal Reserve change interest rates before {date}?"),
    (MarketCategory::Politics, "Will a new crypto bill pass either chamber of Congress before {date}?"),
    (MarketCategory::Crypto, "Will total stablecoin supply grow by more than 5% before {date}?"),
    (MarketCategory::Technology, "Will a top-10 tech company announce a blockchain product before {date}?"),
    (MarketCategory::Economy, "Will US CPI inflation print below the prior month before {date}?"),
];

/// Days added to the horizon on each extra pass over the templates
const PASS_STRIDE_DAYS: u32 = 7;

fn format_date(end: DateTime<Utc>) -> String {
    end.format("%B %-d, %Y").to_string()
}

/// Template-based question source
#[derive(Debug, Clone)]
pub struct TemplateQuestionSource {
    duration_days: u32,
}

impl TemplateQuestionSource {
    pub fn new(duration_days: u32) -> Self {
        Self {
            duration_days: duration_days.clamp(1, MAX_DURATION_DAYS),
        }
    }

    fn question_for(&self, event: &NewsEvent, date: &str) -> MarketProposal {
        let title = event.title.trim().trim_end_matches(&['.', '!', '?'][..]);
        let question = match event.urgency {
            Urgency::Breaking => format!(
                "Will \"{}\" be confirmed by an official source before {}?",
                title, date
            ),
            Urgency::Timely => format!("Will \"{}\" happen as announced before {}?", title, date),
            Urgency::Evergreen => format!(
                "Will there be major follow-up news on \"{}\" before {}?",
                title, date
            ),
        };
        // Breaking stories resolve fast
        let duration_days = match event.urgency {
            Urgency::Breaking => Some(self.duration_days.clamp(1, 7)),
            _ => None,
        };
        MarketProposal {
            question,
            category: event.suggested_category,
            duration_days,
            source_news_id: Some(event.id.clone()),
        }
    }
}

impl Default for TemplateQuestionSource {
    fn default() -> Self {
        Self::new(30)
    }
}

impl QuestionSource for TemplateQuestionSource {
    fn propose(&self, count: usize, iteration: u64, news: &[NewsEvent]) -> Vec<MarketProposal> {
        let now = Utc::now();
        let date = match end_time_after(now, self.duration_days) {
            Ok(end) => format_date(end),
            Err(_) => return Vec::new(),
        };

        let mut ranked: Vec<&NewsEvent> = news.iter().collect();
        ranked.sort_by(|a, b| {
            b.relevance_score
                .cmp(&a.relevance_score)
                .then(b.published_at.cmp(&a.published_at))
        });

        let mut seen = HashSet::new();
        let mut proposals = Vec::with_capacity(count);
        for event in ranked {
            if proposals.len() >= count {
                break;
            }
            let proposal = self.question_for(event, &date);
            if seen.insert(proposal.question.clone()) {
                proposals.push(proposal);
            }
        }

        // Rotate through templates so consecutive cycles differ. Each extra
        // pass pushes the horizon out a week so the questions stay distinct.
        let offset = (iteration as usize) % EVERGREEN.len();
        let mut pass: u32 = 0;
        while proposals.len() < count {
            let horizon = match pass
                .checked_mul(PASS_STRIDE_DAYS)
                .and_then(|extra| self.duration_days.checked_add(extra))
            {
                Some(days) if days <= MAX_DURATION_DAYS => days,
                _ => break,
            };
            let date = match end_time_after(now, horizon) {
                Ok(end) => format_date(end),
                Err(_) => break,
            };

            for i in 0..EVERGREEN.len() {
                if proposals.len() >= count {
                    break;
                }
                let (category, template) = EVERGREEN[(offset + i) % EVERGREEN.len()];
                let question = template.replace("{date}", &date);
                if seen.insert(question.clone()) {
                    proposals.push(MarketProposal {
                        question,
                        category,
                        duration_days: (pass > 0).then_some(horizon),
                        source_news_id: None,
                    });
                }
            }
            pass += 1;
        }

        proposals
    }
}
