use chrono::{DateTime, Utc};

use super::NewsSource;
use crate::config::Config;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::model::Event;

pub type BoxedSource = Box<dyn NewsSource + Send + Sync>;

/// Gathers events from every enabled source. One failing source never
/// costs the others their results.
pub struct NewsCollector {
    sources: Vec<BoxedSource>,
}

impl NewsCollector {
    pub fn new(sources: Vec<BoxedSource>) -> Self {
        log(
            Level::Info,
            Domain::News,
            "sources_initialized",
            obj(&[("count", v_int(sources.len() as i64))]),
        );
        Self { sources }
    }

    /// Keep only the sources named in `NEWS_SOURCES`.
    pub fn from_config(cfg: &Config, available: Vec<BoxedSource>) -> Self {
        let enabled = available
            .into_iter()
            .filter(|s| cfg.source_enabled(s.name()))
            .collect();
        Self::new(enabled)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn collect(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        if end < start {
            log(
                Level::Error,
                Domain::News,
                "invalid_range",
                obj(&[
                    ("from", v_str(&start.to_rfc3339())),
                    ("to", v_str(&end.to_rfc3339())),
                ]),
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        for source in &self.sources {
            match source.fetch_events(start, end).await {
                Ok(fetched) => {
                    let total = fetched.len();
                    let kept: Vec<Event> = fetched
                        .into_iter()
                        .filter(|e| e.timestamp >= start && e.timestamp <= end)
                        .collect();
                    log(
                        Level::Info,
                        Domain::News,
                        "source_collected",
                        obj(&[
                            ("source", v_str(source.name())),
                            ("kept", v_int(kept.len() as i64)),
                            ("outside_range", v_int((total - kept.len()) as i64)),
                        ]),
                    );
                    events.extend(kept);
                }
                Err(e) => {
                    log(
                        Level::Error,
                        Domain::News,
                        "source_failed",
                        obj(&[
                            ("source", v_str(source.name())),
                            ("error", v_str(&format!("{:#}", e))),
                        ]),
                    );
                }
            }
        }

        if events.is_empty() {
            log(
                Level::Warn,
                Domain::News,
                "nothing_collected",
                obj(&[
                    ("from", v_str(&start.to_rfc3339())),
                    ("to", v_str(&end.to_rfc3339())),
                ]),
            );
        } else {
            log(
                Level::Info,
                Domain::News,
                "collected",
                obj(&[("total", v_int(events.len() as i64))]),
            );
        }
        events
    }
}
