//! Integration tests for the replay pipeline
//!
//! Each test lays out a price folder in a temp directory, replays it into a
//! sink and checks what was committed and when. Time is paused, so pacing
//! sleeps complete instantly but still advance the tokio clock.

use cedar_replay::replay::{
    parse_timestamp, replay, MemorySink, ReplayOptions, Sink, SpeedFactor, SqliteSink,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const HEADER: &str = "date,station_uuid,diesel,e5,e10,dieselchange,e5change,e10change";

fn write_partition(root: &Path, relative: &str, rows: &[&str]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut body = String::from(HEADER);
    for row in rows {
        body.push('\n');
        body.push_str(row);
    }
    body.push('\n');
    fs::write(path, body).unwrap();
}

fn options(root: &Path, speed: f64) -> ReplayOptions {
    ReplayOptions {
        price_folder: root.to_path_buf(),
        speed: SpeedFactor::new(speed).unwrap(),
        resume_override: None,
    }
}

fn ts(s: &str) -> i64 {
    parse_timestamp(s).unwrap()
}

fn assert_near(actual: Duration, expected: Duration) {
    let diff = if actual > expected { actual - expected } else { expected - actual };
    assert!(
        diff <= Duration::from_millis(5),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

/// Folder with one day: two stations at 09:00, one update at 09:05.
fn morning_folder() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_partition(
        dir.path(),
        "2024/01/2024-01-01-prices.csv",
        &[
            "2024-01-01 09:00:00+01,aaa,1.729,1.859,1.799,1,1,1",
            "2024-01-01 09:00:00+01,bbb,1.739,1.869,1.809,1,0,0",
            "2024-01-01 09:05:00+01,aaa,1.719,1.859,1.799,1,0,0",
        ],
    );
    dir
}

#[tokio::test(start_paused = true)]
async fn test_first_run_paces_second_batch() {
    let dir = morning_folder();
    let mut sink = MemorySink::new();

    let report = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap();

    assert_eq!(report.batches_committed, 2);
    assert_eq!(report.events_committed, 3);
    assert_eq!(report.partitions_read, 1);

    let committed = sink.committed();
    assert_eq!(committed[0].batch.len(), 2);
    assert_eq!(committed[0].batch.timestamp(), ts("2024-01-01T08:00:00Z"));
    assert_eq!(committed[1].batch.len(), 1);
    assert_near(
        committed[1].committed_at - committed[0].committed_at,
        Duration::from_secs(5),
    );
}

#[tokio::test(start_paused = true)]
async fn test_sqlite_store_resumes_where_it_stopped() {
    let data = morning_folder();
    let db_dir = TempDir::new().unwrap();
    let db_path = db_dir.path().join("prices.db");
    let db_path = db_path.to_str().unwrap();

    {
        let mut store = SqliteSink::open(db_path, Duration::from_secs(5)).unwrap();
        let started = Instant::now();
        let report = replay(&mut store, &options(data.path(), 60.0)).await.unwrap();
        assert_eq!(report.events_committed, 3);
        assert_near(started.elapsed(), Duration::from_secs(5));
        assert_eq!(
            store.high_water_mark().await.unwrap(),
            Some(ts("2024-01-01T08:05:00Z"))
        );
    }

    // a later day arrives; a restart only applies what is new
    write_partition(
        data.path(),
        "2024/01/2024-01-02-prices.csv",
        &["2024-01-02 06:00:00+01,bbb,1.749,1.869,1.809,1,0,0"],
    );

    let mut store = SqliteSink::open(db_path, Duration::from_secs(5)).unwrap();
    let started = Instant::now();
    let report = replay(&mut store, &options(data.path(), 60.0)).await.unwrap();

    assert_eq!(report.boundary.as_deref(), Some("2024-01-01T08:05:00+00:00"));
    assert_eq!(report.events_committed, 1);
    // the whole boundary day is read again and skipped
    assert_eq!(report.events_skipped, 3);
    // both days are at or after the partition floor
    assert_eq!(report.partitions_read, 2);
    // first batch of a run never waits
    assert_near(started.elapsed(), Duration::ZERO);

    let status = store.status().unwrap();
    assert_eq!(status.rows, 4);
    assert_eq!(status.stations, 2);

    let again = replay(&mut store, &options(data.path(), 60.0)).await.unwrap();
    assert_eq!(again.events_committed, 0);
    assert_eq!(store.status().unwrap().rows, 4);
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_mark_skips_applied_batch() {
    let dir = morning_folder();
    let mut seeded = MemorySink::new();
    replay(&mut seeded, &options(dir.path(), 60.0)).await.unwrap();
    let first_batch = seeded.committed()[0].batch.clone();

    let mut sink = MemorySink::with_history([first_batch]);
    let started = Instant::now();
    let report = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap();

    assert_eq!(report.events_skipped, 2);
    assert_eq!(report.batches_committed, 1);
    assert_eq!(report.first_committed.as_deref(), Some("2024-01-01T08:05:00+00:00"));
    assert_near(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_negative_offset_partition_straddling_boundary_is_replayed() {
    let dir = TempDir::new().unwrap();
    // local day 01-01 at -05:00 runs until 05:00Z on 01-02
    write_partition(
        dir.path(),
        "2024-01-01-prices.csv",
        &[
            "2024-01-01 22:00:00-05,aaa,3.459,3.659,3.559,1,0,0",
            "2024-01-01 23:00:00-05,aaa,3.449,3.659,3.559,1,0,0",
        ],
    );

    let mut sink = MemorySink::new();
    let mut opts = options(dir.path(), 60.0);
    opts.resume_override = Some(ts("2024-01-02T03:00:00Z"));

    let report = replay(&mut sink, &opts).await.unwrap();

    assert_eq!(report.partitions_read, 1);
    assert_eq!(report.events_skipped, 1);
    assert_eq!(report.events_committed, 1);
    assert_eq!(report.first_committed.as_deref(), Some("2024-01-02T04:00:00+00:00"));
}

#[tokio::test(start_paused = true)]
async fn test_unordered_partition_commits_nothing_from_it() {
    let dir = TempDir::new().unwrap();
    write_partition(
        dir.path(),
        "2024-01-01-prices.csv",
        &[
            "2024-01-01 09:00:00+01,aaa,1.729,1.859,1.799,1,1,1",
            "2024-01-01 09:30:00+01,aaa,1.719,1.859,1.799,1,0,0",
        ],
    );
    write_partition(
        dir.path(),
        "2024-01-02-prices.csv",
        &[
            "2024-01-02 09:10:00+01,aaa,1.709,1.859,1.799,1,0,0",
            "2024-01-02 09:05:00+01,bbb,1.739,1.869,1.809,1,0,0",
        ],
    );

    let mut sink = MemorySink::new();
    let err = replay(&mut sink, &options(dir.path(), 1_000_000.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "out_of_order");
    assert!(err.to_string().contains("2024-01-02-prices.csv"));
    // the 09:30 batch was still open when the next day failed validation
    assert_eq!(sink.event_count(), 1);
    assert!(sink
        .batches()
        .all(|b| b.timestamp() < ts("2024-01-02T00:00:00Z")));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_row_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    write_partition(
        dir.path(),
        "2024-01-01-prices.csv",
        &[
            "2024-01-01 09:00:00+01,aaa,1.729,1.859,1.799,1,1,1",
            "2024-01-01 09:05:00+01,bbb,not-a-price,1.869,1.809,1,0,0",
        ],
    );

    let mut sink = MemorySink::new();
    let err = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap_err();

    assert_eq!(err.kind(), "malformed_record");
    assert!(err.to_string().contains("2024-01-01-prices.csv:3"));
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_commit_leaves_previous_mark() {
    let dir = morning_folder();
    let mut sink = MemorySink::new().fail_on_attempt(2);

    let err = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap_err();
    assert_eq!(err.kind(), "commit_failed");
    assert_eq!(
        sink.high_water_mark().await.unwrap(),
        Some(ts("2024-01-01T08:00:00Z"))
    );

    // after recovery the next run picks up the missing batch only
    sink.recover();
    let report = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap();
    assert_eq!(report.events_committed, 1);
    assert_eq!(sink.event_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_empty_folder_is_a_clean_run() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("README.txt"), "not a partition").unwrap();

    let mut sink = MemorySink::new();
    let report = replay(&mut sink, &options(dir.path(), 60.0)).await.unwrap();

    assert_eq!(report.partitions_read, 0);
    assert_eq!(report.events_committed, 0);
    assert_eq!(sink.attempts(), 0);
}
