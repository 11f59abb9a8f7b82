//! Top-level analysis pass: pick the events near a move, rank them, and
//! record the result.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::logging::{log, obj, v_int, v_num, v_str, Domain, Level};
use crate::model::{Event, PriceChange, ScoredEvent};
use crate::scoring::ImpactScorer;
use crate::sentiment::LexiconAnalyzer;
use crate::storage::CorrelationStore;

pub struct EventAnalyzer {
    scorer: ImpactScorer,
    window: Duration,
}

impl Default for EventAnalyzer {
    fn default() -> Self {
        Self::new(ImpactScorer::new())
    }
}

impl EventAnalyzer {
    pub fn new(scorer: ImpactScorer) -> Self {
        Self {
            scorer,
            window: Duration::hours(24),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let scorer = if cfg.infer_sentiment {
            ImpactScorer::new().with_inference(LexiconAnalyzer::new())
        } else {
            ImpactScorer::new()
        };
        Self::new(scorer).with_window(cfg.window())
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn scorer(&self) -> &ImpactScorer {
        &self.scorer
    }

    /// Events within `window` of the move on either side, bounds included.
    pub fn find_relevant_events(&self, price_change: &PriceChange, events: &[Event]) -> Vec<Event> {
        let start = price_change
            .timestamp
            .checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = price_change
            .timestamp
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Rank the relevant events and persist them.
    ///
    /// Scoring errors are returned. A failed save is logged and the ranking
    /// is still returned, so one bad write does not end a run.
    pub fn analyze(
        &self,
        store: &mut CorrelationStore,
        price_change: &PriceChange,
        events: &[Event],
    ) -> Result<Vec<ScoredEvent>> {
        let relevant = self.find_relevant_events(price_change, events);
        let ranked = self.scorer.score(price_change, &relevant)?;

        log(
            Level::Info,
            Domain::Scoring,
            "analysis",
            obj(&[
                ("at", v_str(&price_change.timestamp.to_rfc3339())),
                ("pct_change", v_num(price_change.percentage_change)),
                ("candidates", v_int(events.len() as i64)),
                ("relevant", v_int(relevant.len() as i64)),
            ]),
        );

        if let Err(e) = store.save_analysis_results(price_change, &ranked) {
            log(
                Level::Error,
                Domain::Store,
                "analysis_not_saved",
                obj(&[
                    ("at", v_str(&price_change.timestamp.to_rfc3339())),
                    ("error", v_str(&format!("{:#}", e))),
                ]),
            );
        }
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_window_bounds_inclusive() {
        let analyzer = EventAnalyzer::default();
        let pc = PriceChange::new(at(4, 12), 15.0);
        let events = vec![
            Event::new(at(3, 12), "NEWS", "a", "exactly -24h"),
            Event::new(at(3, 11), "NEWS", "b", "too early"),
            Event::new(at(5, 12), "NEWS", "c", "exactly +24h"),
            Event::new(at(5, 13), "NEWS", "d", "too late"),
        ];
        let kept = analyzer.find_relevant_events(&pc, &events);
        let sources: Vec<&str> = kept.iter().map(|e| e.source.as_str()).collect();
        assert_eq!(sources, vec!["a", "c"]);
    }

    #[test]
    fn test_custom_window() {
        let analyzer = EventAnalyzer::default().with_window(Duration::hours(1));
        let pc = PriceChange::new(at(4, 12), 15.0);
        let events = vec![Event::new(at(4, 10), "NEWS", "a", "2h before")];
        assert!(analyzer.find_relevant_events(&pc, &events).is_empty());
    }

    #[test]
    fn test_huge_window_keeps_everything() {
        let analyzer = EventAnalyzer::default().with_window(Duration::MAX);
        let pc = PriceChange::new(at(4, 12), 15.0);
        let events = vec![Event::new(at(1, 0), "NEWS", "a", "days before")];
        assert_eq!(analyzer.find_relevant_events(&pc, &events).len(), 1);
    }

    #[test]
    fn test_save_failure_does_not_fail_analysis() {
        // no init(): tables are missing, so every write fails
        let mut store = CorrelationStore::open_in_memory().unwrap();
        let analyzer = EventAnalyzer::default();
        let pc = PriceChange::new(at(4, 12), 15.0);
        let events = vec![Event::new(at(4, 10), "ETF", "Bloomberg", "launch").with_sentiment(0.8)];

        let ranked = analyzer.analyze(&mut store, &pc, &events).unwrap();
        assert_eq!(ranked.len(), 1);
        assert!((ranked[0].impact_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_scoring_error_propagates() {
        let mut store = CorrelationStore::open_in_memory().unwrap();
        store.init().unwrap();
        let analyzer = EventAnalyzer::default();
        let pc = PriceChange::new(at(4, 12), f64::INFINITY);
        assert!(analyzer.analyze(&mut store, &pc, &[]).is_err());
        assert_eq!(store.count_price_changes().unwrap(), 0);
    }

    #[test]
    fn test_from_config_toggles_inference() {
        let on = EventAnalyzer::from_config(&Config::default());
        assert!(on.scorer().infers_sentiment());
        let off = EventAnalyzer::from_config(&Config {
            infer_sentiment: false,
            ..Config::default()
        });
        assert!(!off.scorer().infers_sentiment());
    }
}
