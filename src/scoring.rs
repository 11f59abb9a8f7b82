//! Event impact scoring.
//!
//! Each candidate event gets `min(1, temporal * sentiment * category)`:
//! - temporal: `1 / (1 + |hours between event and move|)`
//! - sentiment: `|s|` when the sentiment sign agrees with the move, a flat
//!   0.5 when it disagrees (or the move is exactly zero), 1.0 when unknown
//! - category: per event type tag, 1.0 unless listed in the weight table
//!
//! Results are ranked by impact, highest first, ties kept in input order.

use std::collections::HashMap;

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};

use crate::logging::{log, obj, v_int, v_num, v_str, Domain, Level};
use crate::model::{event_type, Event, PriceChange, ScoredEvent};
use crate::sentiment::{infer_sentiment, PolarityAnalyzer};

pub const MISMATCH_SENTIMENT_FACTOR: f64 = 0.5;
pub const UNKNOWN_SENTIMENT_FACTOR: f64 = 1.0;
pub const DEFAULT_CATEGORY_WEIGHT: f64 = 1.0;

pub fn default_weights() -> HashMap<String, f64> {
    HashMap::from([
        (event_type::ETF.to_string(), 1.5),
        (event_type::REGULATION.to_string(), 1.2),
    ])
}

/// `1 / (1 + |Δhours|)`. Equals 1.0 at zero distance and never reaches 0.
pub fn temporal_factor(event_ts: DateTime<Utc>, reference_ts: DateTime<Utc>) -> f64 {
    let hours = (reference_ts - event_ts).num_milliseconds().abs() as f64 / 3_600_000.0;
    1.0 / (1.0 + hours)
}

pub fn sentiment_factor(sentiment: Option<f64>, percentage_change: f64) -> f64 {
    match sentiment {
        None => UNKNOWN_SENTIMENT_FACTOR,
        Some(s) => {
            let agrees = (percentage_change > 0.0 && s > 0.0)
                || (percentage_change < 0.0 && s < 0.0);
            if agrees {
                s.abs()
            } else {
                MISMATCH_SENTIMENT_FACTOR
            }
        }
    }
}

pub struct ImpactScorer {
    weights: HashMap<String, f64>,
    analyzer: Option<Box<dyn PolarityAnalyzer + Send + Sync>>,
}

impl Default for ImpactScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImpactScorer {
    pub fn new() -> Self {
        Self {
            weights: default_weights(),
            analyzer: None,
        }
    }

    /// Add or override the weight for an event type tag. Weights must be
    /// finite and non-negative.
    pub fn with_weight(mut self, tag: &str, weight: f64) -> Result<Self> {
        ensure!(
            weight.is_finite() && weight >= 0.0,
            "category weight for {} must be finite and non-negative, got {}",
            tag,
            weight
        );
        self.weights.insert(tag.to_string(), weight);
        Ok(self)
    }

    /// Infer sentiment for unscored events before scoring them.
    pub fn with_inference<A>(mut self, analyzer: A) -> Self
    where
        A: PolarityAnalyzer + Send + Sync + 'static,
    {
        self.analyzer = Some(Box::new(analyzer));
        self
    }

    pub fn infers_sentiment(&self) -> bool {
        self.analyzer.is_some()
    }

    pub fn category_weight(&self, tag: &str) -> f64 {
        self.weights
            .get(tag)
            .copied()
            .unwrap_or(DEFAULT_CATEGORY_WEIGHT)
    }

    /// Always in [0, 1].
    pub fn impact(&self, event: &Event, price_change: &PriceChange) -> f64 {
        let raw = temporal_factor(event.timestamp, price_change.timestamp)
            * sentiment_factor(event.sentiment_score, price_change.percentage_change)
            * self.category_weight(&event.event_type);
        raw.clamp(0.0, 1.0)
    }

    /// Score and rank `events` against `price_change`.
    ///
    /// Fails on non-finite inputs rather than emitting a meaningless score.
    pub fn score(&self, price_change: &PriceChange, events: &[Event]) -> Result<Vec<ScoredEvent>> {
        ensure!(
            price_change.percentage_change.is_finite(),
            "percentage change must be finite, got {}",
            price_change.percentage_change
        );

        let mut events = events.to_vec();
        if let Some(analyzer) = &self.analyzer {
            infer_sentiment(&mut events, analyzer.as_ref());
        }

        let mut scored = Vec::with_capacity(events.len());
        for event in events {
            if let Some(s) = event.sentiment_score {
                ensure!(
                    s.is_finite(),
                    "sentiment score must be finite for event from {}",
                    event.source
                );
            }
            let impact_score = self.impact(&event, price_change);
            log(
                Level::Trace,
                Domain::Scoring,
                "event_scored",
                obj(&[
                    ("event_type", v_str(&event.event_type)),
                    ("source", v_str(&event.source)),
                    ("impact", v_num(impact_score)),
                ]),
            );
            scored.push(ScoredEvent {
                event,
                impact_score,
                confidence_level: None,
            });
        }

        // sort_by is stable, so equal impacts keep input order
        scored.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));

        log(
            Level::Debug,
            Domain::Scoring,
            "ranked",
            obj(&[
                ("pct_change", v_num(price_change.percentage_change)),
                ("candidates", v_int(scored.len() as i64)),
                (
                    "top_impact",
                    v_num(scored.first().map(|s| s.impact_score).unwrap_or(0.0)),
                ),
            ]),
        );
        Ok(scored)
    }
}
