use anyhow::{ensure, Result};
use chrono::{DateTime, Duration, Utc};

use super::PriceFeed;
use crate::config::Config;
use crate::logging::{log, log_price_change, obj, v_int, v_num, v_str, Domain, Level};
use crate::model::PriceChange;
use crate::retry::{retry_async, RetryConfig};

/// Walks a time range and reports moves whose size meets the threshold.
///
/// At each step `t` the price at `t` is compared with the price at
/// `t - step`. A missing quote on either side skips the step.
#[derive(Debug, Clone)]
pub struct PriceMovementDetector {
    symbol: String,
    threshold_pct: f64,
    step: Duration,
    retry: RetryConfig,
}

impl PriceMovementDetector {
    pub fn new(symbol: &str, threshold_pct: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            threshold_pct,
            step: Duration::days(1),
            retry: RetryConfig::default(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(&cfg.symbol, cfg.threshold_pct).with_step(cfg.price_step())
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn threshold_pct(&self) -> f64 {
        self.threshold_pct
    }

    /// Quote at `ts`. Feed errors survive retries as a missing quote.
    async fn price_at<F>(&self, feed: &F, ts: DateTime<Utc>) -> Option<f64>
    where
        F: PriceFeed + Sync + ?Sized,
    {
        match retry_async(&self.retry, "get_price", || feed.get_price(ts)).await {
            Ok(price) => price,
            Err(e) => {
                log(
                    Level::Error,
                    Domain::Feed,
                    "price_unavailable",
                    obj(&[
                        ("symbol", v_str(&self.symbol)),
                        ("at", v_str(&ts.to_rfc3339())),
                        ("error", v_str(&format!("{:#}", e))),
                    ]),
                );
                None
            }
        }
    }

    pub async fn detect<F>(
        &self,
        feed: &F,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PriceChange>>
    where
        F: PriceFeed + Sync + ?Sized,
    {
        ensure!(self.step > Duration::zero(), "detector step must be positive");
        ensure!(
            self.threshold_pct.is_finite() && self.threshold_pct >= 0.0,
            "threshold must be a non-negative number, got {}",
            self.threshold_pct
        );

        let mut found = Vec::new();
        let mut t = start;
        while t <= end {
            let current = self.price_at(feed, t).await;
            let previous = self.price_at(feed, t - self.step).await;

            if let (Some(before), Some(after)) = (previous, current) {
                if let Some(change) = PriceChange::between(t, before, after) {
                    if change.is_significant(self.threshold_pct) {
                        log_price_change(
                            &self.symbol,
                            &t.to_rfc3339(),
                            before,
                            after,
                            change.percentage_change,
                        );
                        found.push(change);
                    }
                }
            }
            t += self.step;
        }

        log(
            Level::Info,
            Domain::Market,
            "scan_complete",
            obj(&[
                ("symbol", v_str(&self.symbol)),
                ("from", v_str(&start.to_rfc3339())),
                ("to", v_str(&end.to_rfc3339())),
                ("threshold_pct", v_num(self.threshold_pct)),
                ("moves", v_int(found.len() as i64)),
            ]),
        );
        Ok(found)
    }
}
