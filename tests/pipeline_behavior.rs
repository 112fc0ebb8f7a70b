//! Behavior tests for the fetch → normalize → write pipeline, run against the
//! in-memory store.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use market_snapshot::config::Config;
use market_snapshot::errors::{Result, SnapshotError};
use market_snapshot::models::record::{DateRange, RawRow, SnapshotKey};
use market_snapshot::scrapers::InstrumentFetcher;
use market_snapshot::services::pipeline::{RunOutcome, SnapshotPipeline};
use market_snapshot::services::snapshot_writer::{HistoryKind, SnapshotWriter};
use market_snapshot::store::{DocumentPath, DocumentStore, DocumentWrite, MemoryStore};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

struct StaticFetcher {
    rows: Vec<RawRow>,
}

#[async_trait]
impl InstrumentFetcher for StaticFetcher {
    fn source_name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self, _range: &DateRange, _codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        Ok(self.rows.clone())
    }
}

struct FailingFetcher;

#[async_trait]
impl InstrumentFetcher for FailingFetcher {
    fn source_name(&self) -> &'static str {
        "failing"
    }

    async fn fetch(&self, _range: &DateRange, _codes: Option<&[String]>) -> Result<Vec<RawRow>> {
        Err(SnapshotError::FetchError("connection reset".to_string()))
    }
}

/// Store that never answers within the commit timeout.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl DocumentStore for SlowStore {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn commit_batch(&self, writes: Vec<DocumentWrite>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit_batch(writes).await
    }

    async fn merge_document(&self, write: DocumentWrite) -> Result<()> {
        self.inner.merge_document(write).await
    }

    async fn read_collection(&self, collection: &DocumentPath) -> Result<Vec<(String, market_snapshot::store::Document)>> {
        self.inner.read_collection(collection).await
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, d).unwrap()
}

fn test_config() -> Config {
    Config::new().with_commit_pause(Duration::ZERO)
}

fn rows(count: usize) -> Vec<RawRow> {
    (0..count)
        .map(|i| RawRow::new(format!("F{:04}", i), day(3), format!("{},5", i + 1)))
        .collect()
}

fn pipeline(config: Config, rows: Vec<RawRow>, store: Arc<MemoryStore>) -> SnapshotPipeline {
    SnapshotPipeline::new(config, Arc::new(StaticFetcher { rows }), store).expect("valid config")
}

fn records_path(key: &SnapshotKey) -> DocumentPath {
    SnapshotWriter::records_collection(key).expect("valid key")
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn when_the_same_snapshot_is_written_twice_stored_state_is_unchanged() {
    // Given: a store with a fixed clock and a fetch of 25 funds
    let clock = Utc.with_ymd_and_hms(2025, 12, 3, 16, 42, 0).unwrap();
    let store = Arc::new(MemoryStore::new().with_fixed_clock(clock));
    let key = SnapshotKey::intraday("fonlar", &day(3), "19:42");
    let run = pipeline(test_config().with_chunk_size(10), rows(25), store.clone());

    // When: the run is replayed
    run.run_snapshot(key.clone(), &DateRange::single(day(3)), None).await.unwrap();
    let first = store.dump();
    run.run_snapshot(key, &DateRange::single(day(3)), None).await.unwrap();

    // Then: nothing changed
    assert_eq!(first, store.dump());
    assert_eq!(first.len(), 25 + 2, "25 records plus date and snapshot containers");
}

// =============================================================================
// Partial failure isolation
// =============================================================================

#[tokio::test]
async fn when_one_price_is_malformed_the_other_nine_are_written() {
    // Given: nine good rows and one "abc"
    let mut input = rows(9);
    input.push(RawRow::new("BAD", day(3), "abc"));
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));

    // When: the pipeline runs
    let outcome = pipeline(test_config(), input, store.clone())
        .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
        .await
        .expect("run succeeds");

    // Then: nine records are stored and the bad row is reported
    assert!(matches!(outcome, RunOutcome::Written { .. }));
    assert_eq!(outcome.written(), 9);
    assert_eq!(outcome.skipped().len(), 1);
    assert_eq!(outcome.skipped()[0].code, "BAD");

    let stored = store.read_collection(&records_path(&key)).await.unwrap();
    assert_eq!(stored.len(), 9);
}

// =============================================================================
// Chunking
// =============================================================================

#[tokio::test]
async fn commit_count_is_ceil_of_records_over_chunk_size() {
    for (n, chunk) in [(1usize, 400usize), (400, 400), (401, 400), (1001, 400), (7, 3)] {
        // Given: n records and a chunk size
        let store = Arc::new(MemoryStore::new());
        let key = SnapshotKey::daily("fonlar", &day(3));

        // When: the snapshot is written
        let outcome = pipeline(test_config().with_chunk_size(chunk), rows(n), store.clone())
            .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
            .await
            .unwrap();

        // Then: ceil(n / chunk) batches, none above the chunk size, covering every record
        let sizes = store.commit_sizes();
        assert_eq!(sizes.len(), (n + chunk - 1) / chunk, "n={} chunk={}", n, chunk);
        assert!(sizes.iter().all(|s| *s <= chunk));
        assert_eq!(sizes.iter().sum::<usize>(), n);

        let stored: BTreeSet<String> = store
            .read_collection(&records_path(&key))
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let expected: BTreeSet<String> = rows(n).into_iter().map(|r| r.code).collect();
        assert_eq!(stored, expected);
        assert_eq!(outcome.written(), n);
    }
}

#[tokio::test(start_paused = true)]
async fn commits_pause_between_chunks_but_not_after_the_last() {
    // Given: 7 records, chunks of 3 and a 1s pause
    let pause = Duration::from_secs(1);
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));
    let run = pipeline(
        Config::new().with_chunk_size(3).with_commit_pause(pause),
        rows(7),
        store.clone(),
    );

    // When: the snapshot is written on a paused clock
    let started = tokio::time::Instant::now();
    let outcome = run
        .run_snapshot(key, &DateRange::single(day(3)), None)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Then: three commits separated by exactly two pauses
    assert_eq!(outcome.written(), 7);
    assert_eq!(store.commit_sizes(), vec![3, 3, 1]);
    assert_eq!(elapsed, pause * 2);
}

#[tokio::test]
async fn chunk_size_above_store_cap_is_rejected_up_front() {
    let store = Arc::new(MemoryStore::new().with_batch_cap(100));
    let result = SnapshotPipeline::new(
        test_config().with_chunk_size(400),
        Arc::new(StaticFetcher { rows: rows(1) }),
        store,
    );
    assert!(matches!(result, Err(SnapshotError::ConfigError(_))));
}

// =============================================================================
// Codes, change and layout
// =============================================================================

#[tokio::test]
async fn codes_with_slash_are_stored_under_safe_keys() {
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("market", &day(3));
    let input = vec![RawRow::new("JPM/PL", day(3), "25.10")];

    pipeline(test_config(), input, store.clone())
        .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
        .await
        .unwrap();

    let stored = store.read_collection(&records_path(&key)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].0, "JPM_PL");
    assert!(store.dump().keys().all(|path| !path.segments().iter().any(|s| s.contains('/'))));
}

#[tokio::test]
async fn change_percent_compares_consecutive_observations() {
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));
    let input = vec![
        RawRow::new("TTE", day(2), "10,0"),
        RawRow::new("TTE", day(3), "11,0"),
        RawRow::new("MAC", day(3), "1.234,56"),
    ];

    pipeline(test_config(), input, store.clone())
        .run_snapshot(key.clone(), &DateRange::lookback(day(3), 5), None)
        .await
        .unwrap();

    let tte = store.document(&records_path(&key).child("TTE").unwrap()).unwrap();
    assert_eq!(tte["price"], json!(11.0));
    assert_eq!(tte["change_percent"], json!(10.0));
    assert_eq!(tte["date"], json!("2025-12-03"));

    let mac = store.document(&records_path(&key).child("MAC").unwrap()).unwrap();
    assert_eq!(mac["price"], json!(1234.56));
    assert_eq!(mac["change_percent"], json!(0.0));
    assert_eq!(mac["name"], json!(""));
    assert_eq!(mac["holder_count"], json!(0));
}

#[tokio::test]
async fn metadata_fills_missing_names() {
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));
    let mut metadata = HashMap::new();
    metadata.insert(
        "TTE".to_string(),
        market_snapshot::InstrumentMetadata { name: "İş Portföy".into(), size: 5e8, holder_count: 3100 },
    );

    pipeline(test_config(), vec![RawRow::new("TTE", day(3), "1,5")], store.clone())
        .with_metadata(metadata)
        .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
        .await
        .unwrap();

    let tte = store.document(&records_path(&key).child("TTE").unwrap()).unwrap();
    assert_eq!(tte["name"], json!("İş Portföy"));
    assert_eq!(tte["holder_count"], json!(3100));
}

#[tokio::test]
async fn intraday_snapshot_creates_date_and_time_containers() {
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::intraday("fonlar", &day(3), "19:42");

    pipeline(test_config(), rows(3), store.clone())
        .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
        .await
        .unwrap();

    let date_doc = DocumentPath::collection("fonlar").child("2025-12-03").unwrap();
    assert!(store.document(&date_doc).unwrap().contains_key("created_at"));

    let container = store.document(&SnapshotWriter::snapshot_container(&key).unwrap()).unwrap();
    assert_eq!(container["record_count"], json!(3));
    assert_eq!(container["time"], json!("19:42"));
    assert!(container.contains_key("captured_at"));
}

// =============================================================================
// Empty input and failures
// =============================================================================

#[tokio::test]
async fn when_no_row_is_valid_nothing_is_written_and_prior_snapshot_survives() {
    // Given: a snapshot already stored at the key
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));
    pipeline(test_config(), rows(2), store.clone())
        .run_snapshot(key.clone(), &DateRange::single(day(3)), None)
        .await
        .unwrap();
    let before = store.dump();
    let commits_before = store.commit_sizes().len();

    // When: a later fetch yields only garbage
    let garbage = vec![RawRow::new("F0000", day(3), ""), RawRow::new("", day(3), "1")];
    let outcome = pipeline(test_config(), garbage, store.clone())
        .run_snapshot(key, &DateRange::single(day(3)), None)
        .await
        .expect("empty snapshot is not an error");

    // Then: a distinguishable no-op, no commit, state untouched
    assert!(outcome.is_noop());
    assert_eq!(outcome.skipped().len(), 2);
    assert_eq!(store.commit_sizes().len(), commits_before);
    assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn fetch_failures_and_empty_fetches_fail_the_run() {
    let store = Arc::new(MemoryStore::new());
    let key = SnapshotKey::daily("fonlar", &day(3));

    let failing = SnapshotPipeline::new(test_config(), Arc::new(FailingFetcher), store.clone()).unwrap();
    let err = failing.run_snapshot(key.clone(), &DateRange::single(day(3)), None).await.unwrap_err();
    assert!(matches!(err, SnapshotError::FetchError(_)));
    assert_eq!(err.category().exit_code(), 1);

    let empty = pipeline(test_config(), Vec::new(), store.clone());
    let err = empty.run_snapshot(key, &DateRange::single(day(3)), None).await.unwrap_err();
    assert!(matches!(err, SnapshotError::FetchError(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn a_failed_chunk_is_fatal_and_a_rerun_fills_the_rest() {
    // Given: a store that drops the connection on the second commit
    let store = Arc::new(MemoryStore::new().with_failure_on_commit(2));
    let key = SnapshotKey::daily("fonlar", &day(3));
    let run = pipeline(test_config().with_chunk_size(4), rows(10), store.clone());

    // When: the run hits the failure
    let err = run.run_snapshot(key.clone(), &DateRange::single(day(3)), None).await.unwrap_err();

    // Then: the run fails with a write error, leaving the first chunk behind
    assert!(matches!(err, SnapshotError::WriteError(_)));
    assert_eq!(err.category().exit_code(), 3);
    assert_eq!(store.read_collection(&records_path(&key)).await.unwrap().len(), 4);

    // And: the container does not claim a record count it never reached
    let container = store.document(&SnapshotWriter::snapshot_container(&key).unwrap()).unwrap();
    assert!(container.contains_key("created_at"));
    assert!(!container.contains_key("record_count"));

    // And: a fresh run against a healthy store completes the snapshot
    let healthy = Arc::new(MemoryStore::new());
    let rerun = pipeline(test_config().with_chunk_size(4), rows(10), healthy.clone());
    let outcome = rerun.run_snapshot(key.clone(), &DateRange::single(day(3)), None).await.unwrap();
    assert_eq!(outcome.written(), 10);
}

#[tokio::test]
async fn commits_that_exceed_the_timeout_fail_the_run() {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(200),
    });
    let config = test_config().with_commit_timeout(Duration::from_millis(20));
    let run = SnapshotPipeline::new(config, Arc::new(StaticFetcher { rows: rows(3) }), store).unwrap();

    let err = run
        .run_snapshot(SnapshotKey::daily("fonlar", &day(3)), &DateRange::single(day(3)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::WriteError(ref msg) if msg.contains("timed out")));
}

// =============================================================================
// History documents
// =============================================================================

#[tokio::test]
async fn history_run_writes_one_document_per_instrument() {
    let store = Arc::new(MemoryStore::new());
    let input = vec![
        RawRow::new("BRK.B", day(2), "470.1"),
        RawRow::new("BRK.B", day(1), "468.0"),
        RawRow::new("AAPL", day(1), "280"),
        RawRow::new("AAPL", day(2), "oops"),
    ];
    let kind = HistoryKind::new("us", "stock", "1y");

    let outcome = pipeline(test_config(), input, store.clone())
        .run_history(&kind, &DateRange::lookback(day(2), 365), None)
        .await
        .unwrap();

    assert_eq!(outcome.written(), 2);
    assert_eq!(outcome.skipped().len(), 1);

    let brk = store
        .document(&DocumentPath::collection("market_grafigi").child("US_BRK.B").unwrap())
        .unwrap();
    assert_eq!(brk["symbol"], json!("BRK.B"));
    assert_eq!(brk["type"], json!("stock"));
    assert_eq!(
        brk["history"],
        json!([{"d": "2025-12-01", "c": 468.0}, {"d": "2025-12-02", "c": 470.1}])
    );
    assert!(brk.contains_key("last_updated"));
}
