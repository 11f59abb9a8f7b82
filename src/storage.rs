//! SQLite persistence for price changes, events and their correlations.
//!
//! Rows are keyed by natural keys backed by UNIQUE constraints:
//! - price change: (timestamp, percentage_change)
//! - event: (timestamp, event_type, source, description)
//! - correlation: (event_id, price_change_id)
//!
//! Rows are never updated once written. A save either lands completely or
//! not at all.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::logging::{log, log_store_failure, obj, v_int, v_num, v_str, Domain, Level, ProfileScope};
use crate::model::{
    Event, PriceChange, ScoredEvent, StoredCorrelation, StoredEvent, StoredPriceChange,
};

/// What one `save_analysis_results` call wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveSummary {
    pub price_change_id: i64,
    pub price_change_inserted: bool,
    pub events_inserted: usize,
    pub events_reused: usize,
    pub correlations_inserted: usize,
    pub correlations_skipped: usize,
}

impl SaveSummary {
    pub fn log_fields(&self) -> Map<String, Value> {
        obj(&[
            ("price_change_id", v_int(self.price_change_id)),
            ("events_inserted", v_int(self.events_inserted as i64)),
            ("events_reused", v_int(self.events_reused as i64)),
            ("correlations_inserted", v_int(self.correlations_inserted as i64)),
            ("correlations_skipped", v_int(self.correlations_skipped as i64)),
        ])
    }
}

pub struct CorrelationStore {
    conn: Connection,
}

/// Event and move instants are stored at full precision so the stored key
/// matches `natural_key()` exactly.
fn to_ns(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| anyhow!("timestamp not representable in nanoseconds: {}", ts))
}

/// Query bound: instants past the i64 nanosecond range clamp to its ends.
fn bound_ns(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or(if ts.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

fn from_ns(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("stored timestamp out of range: {}", ms))
}

fn find_price_change(conn: &Connection, pc: &PriceChange) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM price_changes WHERE timestamp_ns = ?1 AND percentage_change = ?2",
            params![to_ns(pc.timestamp)?, pc.percentage_change],
            |row| row.get(0),
        )
        .optional()?)
}

fn find_event(conn: &Connection, event: &Event) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM events
             WHERE timestamp_ns = ?1 AND event_type = ?2 AND source = ?3 AND description = ?4",
            params![
                to_ns(event.timestamp)?,
                event.event_type,
                event.source,
                event.description
            ],
            |row| row.get(0),
        )
        .optional()?)
}

fn find_correlation(conn: &Connection, event_id: i64, price_change_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM event_price_correlations WHERE event_id = ?1 AND price_change_id = ?2",
            params![event_id, price_change_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Look up by natural key, insert when absent. Returns (id, inserted).
fn ensure_price_change(conn: &Connection, pc: &PriceChange) -> Result<(i64, bool)> {
    if let Some(id) = find_price_change(conn, pc)? {
        return Ok((id, false));
    }
    let changed = conn.execute(
        "INSERT OR IGNORE INTO price_changes
            (timestamp_ns, price_before, price_after, percentage_change, volume)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            to_ns(pc.timestamp)?,
            pc.price_before,
            pc.price_after,
            pc.percentage_change,
            pc.volume
        ],
    )?;
    if changed == 0 {
        // another writer got there first
        let id = find_price_change(conn, pc)?
            .ok_or_else(|| anyhow!("price change vanished after ignored insert"))?;
        return Ok((id, false));
    }
    Ok((conn.last_insert_rowid(), true))
}

fn ensure_event(conn: &Connection, event: &Event) -> Result<(i64, bool)> {
    if let Some(id) = find_event(conn, event)? {
        return Ok((id, false));
    }
    let changed = conn.execute(
        "INSERT OR IGNORE INTO events
            (timestamp_ns, event_type, source, description, sentiment_score)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            to_ns(event.timestamp)?,
            event.event_type,
            event.source,
            event.description,
            event.sentiment_score
        ],
    )?;
    if changed == 0 {
        let id = find_event(conn, event)?
            .ok_or_else(|| anyhow!("event vanished after ignored insert"))?;
        return Ok((id, false));
    }
    Ok((conn.last_insert_rowid(), true))
}

/// Insert the correlation only if the pair has none. Never overwrites.
fn ensure_correlation(
    conn: &Connection,
    event_id: i64,
    price_change_id: i64,
    scored: &ScoredEvent,
) -> Result<bool> {
    if find_correlation(conn, event_id, price_change_id)?.is_some() {
        return Ok(false);
    }
    let changed = conn.execute(
        "INSERT OR IGNORE INTO event_price_correlations
            (event_id, price_change_id, impact_score, confidence_level, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event_id,
            price_change_id,
            scored.impact_score,
            scored.confidence_level,
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(changed > 0)
}

type PriceChangeRow = (i64, i64, f64, f64, f64, Option<f64>);
type EventRow = (i64, i64, String, String, String, Option<f64>);
type CorrelationRow = (i64, i64, i64, f64, Option<f64>, i64);

fn price_change_from_row(r: PriceChangeRow) -> Result<StoredPriceChange> {
    Ok(StoredPriceChange {
        id: r.0,
        change: PriceChange {
            timestamp: from_ns(r.1),
            price_before: r.2,
            price_after: r.3,
            percentage_change: r.4,
            volume: r.5,
        },
    })
}

impl CorrelationStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Create tables and indexes. Safe to call on every start.
    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS price_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ns INTEGER NOT NULL,
                price_before REAL NOT NULL,
                price_after REAL NOT NULL,
                percentage_change REAL NOT NULL,
                volume REAL,
                UNIQUE(timestamp_ns, percentage_change)
            );
            CREATE INDEX IF NOT EXISTS idx_price_changes_ts ON price_changes(timestamp_ns);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ns INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                source TEXT NOT NULL,
                description TEXT NOT NULL,
                sentiment_score REAL,
                UNIQUE(timestamp_ns, event_type, source, description)
            );
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp_ns);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

            CREATE TABLE IF NOT EXISTS event_price_correlations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL REFERENCES events(id),
                price_change_id INTEGER NOT NULL REFERENCES price_changes(id),
                impact_score REAL NOT NULL,
                confidence_level REAL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE(event_id, price_change_id)
            );
            CREATE INDEX IF NOT EXISTS idx_correlations_pc
                ON event_price_correlations(price_change_id);
            COMMIT;",
        )?;
        Ok(())
    }

    /// Persist one detected move. Reuses the existing row on a key match.
    pub fn record_price_change(&mut self, pc: &PriceChange) -> Result<i64> {
        match ensure_price_change(&self.conn, pc) {
            Ok((id, inserted)) => {
                log(
                    Level::Debug,
                    Domain::Store,
                    "price_change",
                    obj(&[
                        ("price_change_id", v_int(id)),
                        ("inserted", Value::Bool(inserted)),
                        ("pct_change", v_num(pc.percentage_change)),
                    ]),
                );
                Ok(id)
            }
            Err(e) => {
                log_store_failure("record_price_change", &e);
                Err(e)
            }
        }
    }

    /// Persist a move and its scored events without duplicating anything
    /// already stored. Runs as one transaction; on error nothing from this
    /// call remains and the error is returned.
    pub fn save_analysis_results(
        &mut self,
        price_change: &PriceChange,
        correlations: &[ScoredEvent],
    ) -> Result<SaveSummary> {
        let _scope = ProfileScope::with_context(
            "save_analysis_results",
            &[("correlations", v_int(correlations.len() as i64))],
        );
        match self.save_in_transaction(price_change, correlations) {
            Ok(summary) => {
                log(
                    Level::Info,
                    Domain::Store,
                    "analysis_saved",
                    summary.log_fields(),
                );
                Ok(summary)
            }
            Err(e) => {
                log_store_failure("save_analysis_results", &e);
                Err(e)
            }
        }
    }

    fn save_in_transaction(
        &mut self,
        price_change: &PriceChange,
        correlations: &[ScoredEvent],
    ) -> Result<SaveSummary> {
        // Dropping an uncommitted transaction rolls it back.
        let tx = self.conn.transaction()?;

        let (price_change_id, price_change_inserted) =
            ensure_price_change(&tx, price_change).context("saving price change")?;
        let mut summary = SaveSummary {
            price_change_id,
            price_change_inserted,
            ..SaveSummary::default()
        };

        for scored in correlations {
            let (event_id, inserted) = ensure_event(&tx, &scored.event)
                .with_context(|| format!("saving event from {}", scored.event.source))?;
            if inserted {
                summary.events_inserted += 1;
            } else {
                summary.events_reused += 1;
            }

            if ensure_correlation(&tx, event_id, price_change_id, scored)
                .context("saving correlation")?
            {
                summary.correlations_inserted += 1;
            } else {
                summary.correlations_skipped += 1;
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Moves with timestamps in `[start, end]`, newest first.
    pub fn get_price_changes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredPriceChange>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_ns, price_before, price_after, percentage_change, volume
             FROM price_changes
             WHERE timestamp_ns BETWEEN ?1 AND ?2
             ORDER BY timestamp_ns DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![bound_ns(start), bound_ns(end)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<PriceChangeRow>>>()?;
        rows.into_iter().map(price_change_from_row).collect()
    }

    /// Events with timestamps in `[start, end]`, newest first.
    pub fn get_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp_ns, event_type, source, description, sentiment_score
             FROM events
             WHERE timestamp_ns BETWEEN ?1 AND ?2
             ORDER BY timestamp_ns DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![bound_ns(start), bound_ns(end)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<EventRow>>>()?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredEvent {
                    id: r.0,
                    event: Event {
                        timestamp: from_ns(r.1),
                        event_type: r.2,
                        source: r.3,
                        description: r.4,
                        sentiment_score: r.5,
                    },
                })
            })
            .collect()
    }

    /// Correlations recorded for one move, highest impact first.
    pub fn get_correlations(&self, price_change_id: i64) -> Result<Vec<StoredCorrelation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, price_change_id, impact_score, confidence_level, created_at_ms
             FROM event_price_correlations
             WHERE price_change_id = ?1
             ORDER BY impact_score DESC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![price_change_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<CorrelationRow>>>()?;
        rows.into_iter()
            .map(|r| {
                Ok(StoredCorrelation {
                    id: r.0,
                    event_id: r.1,
                    price_change_id: r.2,
                    impact_score: r.3,
                    confidence_level: r.4,
                    created_at: from_ms(r.5)?,
                })
            })
            .collect()
    }

    /// The most recent recorded move, if any.
    pub fn last_significant_change(&self) -> Result<Option<StoredPriceChange>> {
        let row: Option<PriceChangeRow> = self
            .conn
            .query_row(
                "SELECT id, timestamp_ns, price_before, price_after, percentage_change, volume
                 FROM price_changes
                 ORDER BY timestamp_ns DESC, id DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(price_change_from_row).transpose()
    }

    pub fn count_price_changes(&self) -> Result<i64> {
        self.count("price_changes")
    }

    pub fn count_events(&self) -> Result<i64> {
        self.count("events")
    }

    pub fn count_correlations(&self) -> Result<i64> {
        self.count("event_price_correlations")
    }

    fn count(&self, table: &'static str) -> Result<i64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .with_context(|| format!("counting {}", table))?;
        log(
            Level::Trace,
            Domain::Store,
            "count",
            obj(&[("table", v_str(table)), ("rows", v_int(n))]),
        );
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::event_type;
    use chrono::Duration;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 4, h, 0, 0).unwrap()
    }

    fn store() -> CorrelationStore {
        let mut s = CorrelationStore::open_in_memory().unwrap();
        s.init().unwrap();
        s
    }

    fn move_at_noon() -> PriceChange {
        PriceChange {
            timestamp: at(12),
            price_before: 60_000.0,
            price_after: 69_000.0,
            percentage_change: 15.0,
            volume: Some(1_234.5),
        }
    }

    fn scored(h: u32, tag: &str, source: &str, impact: f64) -> ScoredEvent {
        ScoredEvent {
            event: Event::new(at(h), tag, source, &format!("{} at {}", tag, h)),
            impact_score: impact,
            confidence_level: None,
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let mut s = store();
        s.init().unwrap();
        assert_eq!(s.count_price_changes().unwrap(), 0);
    }

    #[test]
    fn test_save_twice_no_duplicates() {
        let mut s = store();
        let pc = move_at_noon();
        let corr = vec![
            scored(10, event_type::ETF, "Bloomberg", 0.4),
            scored(18, event_type::REGULATION, "Reuters", 0.0857),
        ];

        let first = s.save_analysis_results(&pc, &corr).unwrap();
        assert!(first.price_change_inserted);
        assert_eq!(first.events_inserted, 2);
        assert_eq!(first.correlations_inserted, 2);

        let second = s.save_analysis_results(&pc, &corr).unwrap();
        assert!(!second.price_change_inserted);
        assert_eq!(second.price_change_id, first.price_change_id);
        assert_eq!(second.events_reused, 2);
        assert_eq!(second.correlations_skipped, 2);

        assert_eq!(s.count_price_changes().unwrap(), 1);
        assert_eq!(s.count_events().unwrap(), 2);
        assert_eq!(s.count_correlations().unwrap(), 2);
    }

    #[test]
    fn test_existing_score_is_never_overwritten() {
        let mut s = store();
        let pc = move_at_noon();
        let summary = s
            .save_analysis_results(&pc, &[scored(10, "ETF", "Bloomberg", 0.4)])
            .unwrap();
        s.save_analysis_results(&pc, &[scored(10, "ETF", "Bloomberg", 0.9)])
            .unwrap();

        let rows = s.get_correlations(summary.price_change_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].impact_score, 0.4);
        assert_eq!(rows[0].confidence_level, None);
    }

    #[test]
    fn test_existing_event_keeps_original_sentiment() {
        let mut s = store();
        let pc = move_at_noon();
        let mut a = scored(10, "NEWS", "wire", 0.3);
        a.event.sentiment_score = Some(0.2);
        let mut b = a.clone();
        b.event.sentiment_score = Some(-0.9);

        s.save_analysis_results(&pc, &[a]).unwrap();
        s.save_analysis_results(&pc, &[b]).unwrap();

        let events = s.get_events(at(0), at(23)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.sentiment_score, Some(0.2));
    }

    #[test]
    fn test_duplicate_events_within_one_call() {
        let mut s = store();
        let e = scored(10, "ETF", "Bloomberg", 0.4);
        let summary = s
            .save_analysis_results(&move_at_noon(), &[e.clone(), e])
            .unwrap();
        assert_eq!(summary.events_inserted, 1);
        assert_eq!(summary.events_reused, 1);
        assert_eq!(summary.correlations_inserted, 1);
        assert_eq!(summary.correlations_skipped, 1);
    }

    #[test]
    fn test_shared_event_links_to_each_move() {
        let mut s = store();
        let e = scored(10, "ETF", "Bloomberg", 0.4);
        let mut other = move_at_noon();
        other.timestamp = at(13);
        other.percentage_change = -6.0;

        s.save_analysis_results(&move_at_noon(), &[e.clone()]).unwrap();
        s.save_analysis_results(&other, &[e]).unwrap();

        assert_eq!(s.count_price_changes().unwrap(), 2);
        assert_eq!(s.count_events().unwrap(), 1);
        assert_eq!(s.count_correlations().unwrap(), 2);
    }

    #[test]
    fn test_same_instant_and_magnitude_collide() {
        // Accepted simplification: the key ignores prices.
        let mut s = store();
        let a = move_at_noon();
        let mut b = a.clone();
        b.price_before = 1.0;
        b.price_after = 1.15;

        let id_a = s.record_price_change(&a).unwrap();
        let id_b = s.record_price_change(&b).unwrap();
        assert_eq!(id_a, id_b);
        assert_eq!(s.count_price_changes().unwrap(), 1);
    }

    #[test]
    fn test_failed_save_rolls_back_everything() {
        let mut s = store();
        s.conn
            .execute_batch(
                "CREATE TRIGGER reject_correlations BEFORE INSERT ON event_price_correlations
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();

        let err = s
            .save_analysis_results(&move_at_noon(), &[scored(10, "ETF", "Bloomberg", 0.4)])
            .unwrap_err();
        assert!(format!("{:#}", err).contains("injected failure"));

        assert_eq!(s.count_price_changes().unwrap(), 0);
        assert_eq!(s.count_events().unwrap(), 0);
        assert_eq!(s.count_correlations().unwrap(), 0);
    }

    #[test]
    fn test_queries_and_roundtrip_fields() {
        let mut s = store();
        let pc = move_at_noon();
        let mut later = move_at_noon();
        later.timestamp = at(12) + Duration::days(1);
        later.percentage_change = -7.5;
        later.volume = None;

        s.record_price_change(&pc).unwrap();
        s.record_price_change(&later).unwrap();

        let all = s.get_price_changes(at(0), at(0) + Duration::days(3)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].change, later);
        assert_eq!(all[1].change, pc);

        let day_one = s.get_price_changes(at(0), at(23)).unwrap();
        assert_eq!(day_one.len(), 1);

        let last = s.last_significant_change().unwrap().unwrap();
        assert_eq!(last.change.percentage_change, -7.5);
    }

    #[test]
    fn test_correlations_ordered_by_impact() {
        let mut s = store();
        let summary = s
            .save_analysis_results(
                &move_at_noon(),
                &[
                    scored(18, "REGULATION", "Reuters", 0.0857),
                    scored(10, "ETF", "Bloomberg", 0.4),
                    scored(14, "TRADE", "Binance", 0.2),
                ],
            )
            .unwrap();
        let impacts: Vec<f64> = s
            .get_correlations(summary.price_change_id)
            .unwrap()
            .iter()
            .map(|c| c.impact_score)
            .collect();
        assert_eq!(impacts, vec![0.4, 0.2, 0.0857]);
    }

    #[test]
    fn test_sub_millisecond_events_stay_distinct() {
        let mut s = store();
        let mut pc = move_at_noon();
        pc.timestamp = at(12) + Duration::microseconds(250);

        let a = scored(10, "NEWS", "wire", 0.3);
        let mut b = a.clone();
        b.event.timestamp = a.event.timestamp + Duration::microseconds(500);
        assert_ne!(a.event.natural_key(), b.event.natural_key());

        let summary = s.save_analysis_results(&pc, &[a, b]).unwrap();
        assert_eq!(summary.events_inserted, 2);
        assert_eq!(summary.correlations_inserted, 2);
        assert_eq!(s.count_events().unwrap(), 2);

        let last = s.last_significant_change().unwrap().unwrap();
        assert_eq!(last.change, pc);
        let events = s.get_events(at(0), at(23)).unwrap();
        assert_eq!(events[0].event.timestamp, at(10) + Duration::microseconds(500));
    }

    #[test]
    fn test_rerun_with_sub_millisecond_move_reuses_row() {
        let mut s = store();
        let mut pc = move_at_noon();
        pc.timestamp = at(12) + Duration::nanoseconds(1_250_001);
        let id = s.record_price_change(&pc).unwrap();
        let summary = s
            .save_analysis_results(&pc, &[scored(10, "ETF", "Bloomberg", 0.4)])
            .unwrap();
        assert_eq!(summary.price_change_id, id);
        assert!(!summary.price_change_inserted);
    }

    #[test]
    fn test_summary_log_fields_are_integers() {
        let fields = SaveSummary {
            price_change_id: 1,
            events_inserted: 2,
            ..SaveSummary::default()
        }
        .log_fields();
        assert!(fields["price_change_id"].is_i64());
        assert!(fields["events_inserted"].is_i64());
        assert_eq!(fields["price_change_id"], 1);
    }

    #[test]
    fn test_empty_store_has_no_last_change() {
        let s = store();
        assert!(s.last_significant_change().unwrap().is_none());
    }
}
