use chrono::{DateTime, TimeZone, Utc};
use pricecause::model::event_type;
use pricecause::{CorrelationStore, Event, ImpactScorer, PriceChange};
use rusqlite::Connection;
use tempfile::TempDir;

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, d, h, 0, 0).unwrap()
}

fn noon_move() -> PriceChange {
    PriceChange {
        timestamp: at(4, 12),
        price_before: 60_000.0,
        price_after: 69_000.0,
        percentage_change: 15.0,
        volume: None,
    }
}

fn events() -> Vec<Event> {
    vec![
        Event::new(at(4, 10), event_type::ETF, "Bloomberg", "New Bitcoin ETF launches").with_sentiment(0.8),
        Event::new(at(4, 18), event_type::REGULATION, "Reuters", "New crypto regulation rules").with_sentiment(-0.3),
        Event::new(at(4, 14), event_type::TRADE, "Binance", "$500M Bitcoin purchase"),
    ]
}

fn open(path: &str) -> CorrelationStore {
    let mut store = CorrelationStore::open(path).unwrap();
    store.init().unwrap();
    store
}

#[test]
fn persisting_across_two_runs_keeps_one_row_each() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs.sqlite");
    let path = path.to_str().unwrap();
    let ranked = ImpactScorer::new().score(&noon_move(), &events()).unwrap();

    // first process
    {
        let mut store = open(path);
        store.save_analysis_results(&noon_move(), &ranked).unwrap();
    }
    // second process over the same window
    {
        let mut store = open(path);
        let summary = store.save_analysis_results(&noon_move(), &ranked).unwrap();
        assert!(!summary.price_change_inserted);
        assert_eq!(summary.events_inserted, 0);
        assert_eq!(summary.correlations_inserted, 0);
    }

    let store = open(path);
    assert_eq!(store.count_price_changes().unwrap(), 1);
    assert_eq!(store.count_events().unwrap(), 3);
    assert_eq!(store.count_correlations().unwrap(), 3);

    let conn = Connection::open(path).unwrap();
    let pairs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT event_id, price_change_id FROM event_price_correlations)",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(pairs, 3);
}

#[test]
fn overlapping_windows_add_only_new_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("overlap.sqlite");
    let mut store = open(path.to_str().unwrap());
    let scorer = ImpactScorer::new();

    let first = scorer.score(&noon_move(), &events()[..2]).unwrap();
    store.save_analysis_results(&noon_move(), &first).unwrap();

    let second = scorer.score(&noon_move(), &events()[1..]).unwrap();
    let summary = store.save_analysis_results(&noon_move(), &second).unwrap();
    assert_eq!(summary.events_inserted, 1);
    assert_eq!(summary.events_reused, 1);
    assert_eq!(summary.correlations_inserted, 1);
    assert_eq!(summary.correlations_skipped, 1);

    assert_eq!(store.count_events().unwrap(), 3);
    assert_eq!(store.count_correlations().unwrap(), 3);

    let stored = store.get_correlations(summary.price_change_id).unwrap();
    assert!((stored[0].impact_score - 0.4).abs() < 1e-9);
}

#[test]
fn failed_write_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fail.sqlite");
    let path = path.to_str().unwrap();
    let mut store = open(path);

    Connection::open(path)
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_events BEFORE INSERT ON events
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let ranked = ImpactScorer::new().score(&noon_move(), &events()).unwrap();
    let err = store.save_analysis_results(&noon_move(), &ranked).unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));

    assert_eq!(store.count_price_changes().unwrap(), 0);
    assert_eq!(store.count_events().unwrap(), 0);
    assert_eq!(store.count_correlations().unwrap(), 0);
}

#[test]
fn unique_constraints_hold_for_direct_writers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("unique.sqlite");
    let path = path.to_str().unwrap();
    let mut store = open(path);
    store.save_analysis_results(&noon_move(), &ImpactScorer::new().score(&noon_move(), &events()).unwrap()).unwrap();

    // a writer bypassing the store still cannot duplicate a natural key
    let conn = Connection::open(path).unwrap();
    let dup = conn.execute(
        "INSERT INTO price_changes (timestamp_ns, price_before, price_after, percentage_change)
         VALUES (?1, 1.0, 2.0, 15.0)",
        [at(4, 12).timestamp_nanos_opt().unwrap()],
    );
    assert!(dup.is_err());
}
