use chrono::Duration;

const DEFAULT_WINDOW_HOURS: i64 = 24;
const DEFAULT_PRICE_STEP_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub sqlite_path: String,
    /// Minimum |percent| move the detector reports.
    pub threshold_pct: f64,
    /// Half-width of the relevance window around a move.
    pub window_hours: i64,
    pub price_step_secs: i64,
    /// Names of enabled news sources.
    pub news_sources: Vec<String>,
    pub infer_sentiment: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            sqlite_path: "./pricecause.sqlite".to_string(),
            threshold_pct: 5.0,
            window_hours: DEFAULT_WINDOW_HOURS,
            price_step_secs: DEFAULT_PRICE_STEP_SECS,
            news_sources: vec!["cryptocompare".to_string()],
            infer_sentiment: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            symbol: std::env::var("SYMBOL").unwrap_or(d.symbol),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            threshold_pct: std::env::var("THRESHOLD_PCT").ok().and_then(|v| v.parse().ok()).unwrap_or(d.threshold_pct),
            window_hours: std::env::var("WINDOW_HOURS").ok().and_then(|v| parse_hours(&v)).unwrap_or(d.window_hours),
            price_step_secs: std::env::var("PRICE_STEP_SECS").ok().and_then(|v| parse_secs(&v)).unwrap_or(d.price_step_secs),
            news_sources: std::env::var("NEWS_SOURCES")
                .map(|v| parse_list(&v))
                .unwrap_or(d.news_sources),
            infer_sentiment: std::env::var("INFER_SENTIMENT")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(d.infer_sentiment),
        }
    }

    /// Falls back to the default when `window_hours` is out of range.
    pub fn window(&self) -> Duration {
        Duration::try_hours(self.window_hours)
            .filter(|d| *d >= Duration::zero())
            .unwrap_or_else(|| Duration::hours(DEFAULT_WINDOW_HOURS))
    }

    /// Falls back to the default when `price_step_secs` is out of range.
    pub fn price_step(&self) -> Duration {
        Duration::try_seconds(self.price_step_secs)
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_PRICE_STEP_SECS))
    }

    pub fn source_enabled(&self, name: &str) -> bool {
        self.news_sources.iter().any(|s| s == name)
    }
}

/// Non-negative hour count that fits a `Duration`.
fn parse_hours(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|h| *h >= 0 && Duration::try_hours(*h).is_some())
}

/// Positive second count that fits a `Duration`.
fn parse_secs(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|s| *s > 0 && Duration::try_seconds(*s).is_some())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
