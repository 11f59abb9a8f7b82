use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event type tags. The tag itself is free-form text.
pub mod event_type {
    pub const ETF: &str = "ETF";
    pub const REGULATION: &str = "REGULATION";
    pub const MARKET: &str = "MARKET";
    pub const NEWS: &str = "NEWS";
    pub const TECHNICAL: &str = "TECHNICAL";
    pub const TRADE: &str = "TRADE";
}

/// A dated piece of news or market activity that may explain a move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub source: String,
    pub description: String,
    /// Polarity in [-1, 1]; `None` until collected or inferred.
    #[serde(default)]
    pub sentiment_score: Option<f64>,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        event_type: &str,
        source: &str,
        description: &str,
    ) -> Self {
        Self {
            timestamp,
            event_type: event_type.to_string(),
            source: source.to_string(),
            description: description.to_string(),
            sentiment_score: None,
        }
    }

    pub fn with_sentiment(mut self, score: f64) -> Self {
        self.sentiment_score = Some(score);
        self
    }

    /// Dedup identity: two events with equal keys are the same row.
    pub fn natural_key(&self) -> (DateTime<Utc>, &str, &str, &str) {
        (
            self.timestamp,
            &self.event_type,
            &self.source,
            &self.description,
        )
    }
}

/// A detected move in the asset price, in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub timestamp: DateTime<Utc>,
    pub price_before: f64,
    pub price_after: f64,
    /// Signed percent, e.g. `15.0` for +15%.
    pub percentage_change: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl PriceChange {
    pub fn new(timestamp: DateTime<Utc>, percentage_change: f64) -> Self {
        Self {
            timestamp,
            price_before: 0.0,
            price_after: 0.0,
            percentage_change,
            volume: None,
        }
    }

    /// Build from two observed prices. Returns `None` when `before` is zero.
    pub fn between(timestamp: DateTime<Utc>, before: f64, after: f64) -> Option<Self> {
        if before == 0.0 {
            return None;
        }
        Some(Self {
            timestamp,
            price_before: before,
            price_after: after,
            percentage_change: (after - before) / before * 100.0,
            volume: None,
        })
    }

    pub fn is_significant(&self, threshold_pct: f64) -> bool {
        self.percentage_change.abs() >= threshold_pct
    }

    /// Dedup identity. Not unique in principle: two moves of identical
    /// magnitude at the same instant share a key.
    pub fn natural_key(&self) -> (DateTime<Utc>, f64) {
        (self.timestamp, self.percentage_change)
    }
}

/// An event paired with its estimated contribution to a price change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEvent {
    pub event: Event,
    /// In [0, 1].
    pub impact_score: f64,
    /// Never computed by the scorer; persisted as NULL.
    #[serde(default)]
    pub confidence_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPriceChange {
    pub id: i64,
    pub change: PriceChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCorrelation {
    pub id: i64,
    pub event_id: i64,
    pub price_change_id: i64,
    pub impact_score: f64,
    pub confidence_level: Option<f64>,
    pub created_at: DateTime<Utc>,
}
