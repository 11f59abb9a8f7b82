//! Collaborator seams: where prices and events come from.
//!
//! Network clients live outside this crate; anything that implements
//! [`PriceFeed`] or [`NewsSource`] can drive detection and analysis. The
//! in-memory implementations here serve replays and tests.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::Event;

pub mod news;
pub mod price;

#[async_trait]
pub trait PriceFeed {
    /// Price of the asset at `ts`, or `None` when the feed has no quote.
    async fn get_price(&self, ts: DateTime<Utc>) -> Result<Option<f64>>;
}

#[async_trait]
pub trait NewsSource {
    fn name(&self) -> &str;
    /// Raw events published in `[start, end]`. Sentiment is optional.
    async fn fetch_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>>;
}

/// Price series with as-of lookup: the latest observation at or before
/// the requested time.
#[derive(Debug, Clone, Default)]
pub struct SeriesPriceFeed {
    points: BTreeMap<DateTime<Utc>, f64>,
}

impl SeriesPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (DateTime<Utc>, f64)>,
    {
        Self {
            points: points.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, ts: DateTime<Utc>, price: f64) {
        self.points.insert(ts, price);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[async_trait]
impl PriceFeed for SeriesPriceFeed {
    async fn get_price(&self, ts: DateTime<Utc>) -> Result<Option<f64>> {
        Ok(self.points.range(..=ts).next_back().map(|(_, p)| *p))
    }
}

/// Fixed list of events, served by time range.
#[derive(Debug, Clone)]
pub struct StaticNewsSource {
    name: String,
    events: Vec<Event>,
}

impl StaticNewsSource {
    pub fn new(name: &str, events: Vec<Event>) -> Self {
        Self {
            name: name.to_string(),
            events,
        }
    }
}

#[async_trait]
impl NewsSource for StaticNewsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect())
    }
}
