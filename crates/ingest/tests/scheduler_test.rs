//! Measurement scheduler tests: commit triggers, shutdown modes, partition
//! switching and per-table fault isolation.

mod common;

use alopex_ingest::table::writer::INDEX_FILE_NAME;
use alopex_ingest::{
    parse_line, CellValue, ColumnMeta, ColumnType, IngestError, MeasurementScheduler,
    PartitionBy, ShutdownMode, TableMetadata, TableWriter,
};
use common::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn submit(scheduler: &MeasurementScheduler, line: &str) {
    let measurement = parse_line(line.as_bytes()).unwrap().unwrap();
    scheduler.submit(measurement).unwrap();
}

fn submit_weather(scheduler: &MeasurementScheduler) {
    for line in WEATHER.lines() {
        submit(scheduler, line);
    }
}

fn wait_for(what: &str, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn committed_rows(root: &Path, table: &str) -> u64 {
    open_table(root, table).row_count()
}

// ============================================================================
// Commit Triggers
// ============================================================================

#[test]
fn test_commit_all_makes_rows_visible() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    submit_weather(&scheduler);
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.stats().records_applied(), 7);
    assert_eq!(scheduler.stats().commits(), 1);

    // Discard keeps only what was committed.
    scheduler.shutdown(ShutdownMode::Discard);
    assert_weather(temp_dir.path());
}

#[test]
fn test_commit_on_row_count() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).with_commit_row_count(3);
    let scheduler = MeasurementScheduler::new(config).unwrap();

    submit_weather(&scheduler);
    wait_for("seven applied records", || scheduler.stats().records_applied() == 7);
    assert_eq!(scheduler.stats().commits(), 2);
    // The seventh row is still pending and is lost.
    scheduler.shutdown(ShutdownMode::Discard);

    let writer = open_table(temp_dir.path(), "weather");
    assert_eq!(writer.row_count(), 6);
    assert_eq!(writer.max_timestamp(), Some(1_465_839_830_102_400));
}

#[test]
fn test_commit_on_interval() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).with_commit_interval(Duration::from_millis(20));
    let scheduler = MeasurementScheduler::new(config).unwrap();

    submit_weather(&scheduler);
    wait_for("a timed commit", || scheduler.stats().commits() > 0);
    scheduler.shutdown(ShutdownMode::Drain);

    assert_weather(temp_dir.path());
}

// ============================================================================
// Shutdown Modes
// ============================================================================

#[test]
fn test_shutdown_drain_commits_pending_rows() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    submit_weather(&scheduler);
    scheduler.shutdown(ShutdownMode::Drain);

    assert_weather(temp_dir.path());
}

#[test]
fn test_shutdown_discard_drops_uncommitted_rows() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    let mut lines = WEATHER.lines();
    for line in lines.by_ref().take(2) {
        submit(&scheduler, line);
    }
    scheduler.commit_all().unwrap();
    for line in lines {
        submit(&scheduler, line);
    }
    scheduler.shutdown(ShutdownMode::Discard);

    let writer = open_table(temp_dir.path(), "weather");
    assert_eq!(writer.row_count(), 2);
    assert_eq!(writer.max_timestamp(), Some(1_465_839_830_100_500));
}

#[test]
fn test_drop_drains() {
    let temp_dir = TempDir::new().unwrap();
    {
        let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
        submit_weather(&scheduler);
    }
    assert_weather(temp_dir.path());
}

#[test]
fn test_submit_after_shutdown_fails() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    let handle = scheduler.handle();
    scheduler.shutdown(ShutdownMode::Drain);

    let measurement = parse_line(b"weather temperature=1").unwrap().unwrap();
    match handle.submit(measurement) {
        Err(IngestError::SchedulerClosed) => {}
        other => panic!("Expected SchedulerClosed, got: {:?}", other),
    }
}

#[test]
fn test_drain_keeps_every_record_accepted_during_shutdown() {
    for _ in 0..5 {
        let temp_dir = TempDir::new().unwrap();
        let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
        let handle = scheduler.handle();
        let measurement =
            parse_line(b"weather,location=a temperature=1 1465839830100400200").unwrap().unwrap();

        let producer = std::thread::spawn(move || {
            let mut accepted = 0u64;
            while handle.submit(measurement.clone()).is_ok() {
                accepted += 1;
            }
            accepted
        });

        wait_for("records in flight", || scheduler.stats().records_applied() > 100);
        scheduler.shutdown(ShutdownMode::Drain);
        let accepted = producer.join().unwrap();

        assert!(accepted > 100);
        assert_eq!(committed_rows(temp_dir.path(), "weather"), accepted);
    }
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).with_writer_threads(0);
    match MeasurementScheduler::new(config) {
        Err(IngestError::InvalidConfig(_)) => {}
        Err(other) => panic!("Expected InvalidConfig, got: {:?}", other),
        Ok(_) => panic!("Expected InvalidConfig, got a scheduler"),
    }
}

// ============================================================================
// Dropped Records
// ============================================================================

#[test]
fn test_type_conflict_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    submit(&scheduler, "weather,location=a temperature=82 1465839830100400200");
    submit(&scheduler, "weather,location=b temperature=\"hot\" 1465839830100500200");
    submit(&scheduler, "weather,location=c temperature=true 1465839830100600200");
    submit(&scheduler, "weather,location=d temperature=83 1465839830100700200");
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.stats().records_applied(), 2);
    assert_eq!(scheduler.stats().records_dropped(), 2);
    assert!(scheduler.offline_tables().is_empty());
    scheduler.shutdown(ShutdownMode::Drain);

    let writer = open_table(temp_dir.path(), "weather");
    let locations: Vec<CellValue> = rows(&writer).into_iter().map(|row| row[0].clone()).collect();
    assert_eq!(
        locations,
        vec![
            CellValue::Symbol("a".to_string()),
            CellValue::Symbol("d".to_string())
        ]
    );
}

#[test]
fn test_float_overflow_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let metadata = TableMetadata::new(
        PartitionBy::None,
        vec![
            ColumnMeta::new("f", ColumnType::Float),
            ColumnMeta::new("timestamp", ColumnType::Timestamp),
        ],
        Some(1),
    );
    drop(TableWriter::create(temp_dir.path().join("t"), metadata, EXTENT).unwrap());

    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    submit(&scheduler, "t f=1e300 1000");
    submit(&scheduler, "t f=1.5 2000");
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.stats().records_applied(), 1);
    assert_eq!(scheduler.stats().records_dropped(), 1);
    scheduler.shutdown(ShutdownMode::Drain);

    let writer = open_table(temp_dir.path(), "t");
    assert_eq!(
        rows(&writer),
        vec![vec![CellValue::Float(1.5), CellValue::Timestamp(2)]]
    );
}

#[test]
fn test_reserved_and_repeated_keys_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    submit(&scheduler, "weather timestamp=1i 1465839830100400200");
    submit(&scheduler, "weather,t=a t=1 1465839830100400200");
    submit(&scheduler, "weather temperature=1 1465839830100400200");
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.stats().records_applied(), 1);
    assert_eq!(scheduler.stats().records_dropped(), 2);
    scheduler.shutdown(ShutdownMode::Drain);

    let writer = open_table(temp_dir.path(), "weather");
    let names: Vec<&str> = writer.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["temperature", "timestamp"]);
}

#[test]
fn test_field_types_from_literals() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();

    submit(
        &scheduler,
        "sensors,site=lab count=3i,ratio=0.25,ok=t,note=\"fine\" 1465839830100400200",
    );
    scheduler.shutdown(ShutdownMode::Drain);

    let writer = open_table(temp_dir.path(), "sensors");
    let types: Vec<ColumnType> = writer.columns().iter().map(|c| c.column_type).collect();
    assert_eq!(
        types,
        vec![
            ColumnType::Symbol,
            ColumnType::Long,
            ColumnType::Double,
            ColumnType::Boolean,
            ColumnType::String,
            ColumnType::Timestamp,
        ]
    );
    assert_eq!(
        rows(&writer),
        vec![vec![
            CellValue::Symbol("lab".to_string()),
            CellValue::Long(3),
            CellValue::Double(0.25),
            CellValue::Boolean(true),
            CellValue::Str("fine".to_string()),
            CellValue::Timestamp(1_465_839_830_100_400),
        ]]
    );
}

// ============================================================================
// Fault Isolation
// ============================================================================

#[test]
fn test_corrupt_table_goes_offline_alone() {
    let temp_dir = TempDir::new().unwrap();
    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    submit(&scheduler, "broken temperature=1 1465839830100400200");
    scheduler.shutdown(ShutdownMode::Drain);

    let index_path = temp_dir
        .path()
        .join("broken")
        .join("default")
        .join(INDEX_FILE_NAME);
    let mut file = OpenOptions::new().write(true).open(&index_path).unwrap();
    file.write_all(&[0u8; 4]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    submit(&scheduler, "broken temperature=2 1465839830100500200");
    submit_weather(&scheduler);
    submit(&scheduler, "broken temperature=3 1465839830100600200");
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.offline_tables(), vec!["broken".to_string()]);
    assert_eq!(scheduler.stats().tables_offline(), 1);
    assert_eq!(scheduler.stats().records_applied(), 7);
    assert_eq!(scheduler.stats().records_dropped(), 2);
    scheduler.shutdown(ShutdownMode::Drain);

    assert_weather(temp_dir.path());
    match TableWriter::open(temp_dir.path().join("broken"), EXTENT) {
        Err(IngestError::BadIndexHeader { actual, .. }) => assert_eq!(actual, 0),
        Err(other) => panic!("Expected BadIndexHeader, got: {:?}", other),
        Ok(_) => panic!("Expected BadIndexHeader, got a writer"),
    }
}

#[test]
fn test_reopen_appends_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let mut lines = WEATHER.lines();

    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    for line in lines.by_ref().take(3) {
        submit(&scheduler, line);
    }
    scheduler.shutdown(ShutdownMode::Drain);
    assert_eq!(committed_rows(temp_dir.path(), "weather"), 3);

    let scheduler = MeasurementScheduler::new(test_config(temp_dir.path())).unwrap();
    for line in lines {
        submit(&scheduler, line);
    }
    scheduler.shutdown(ShutdownMode::Drain);

    assert_weather(temp_dir.path());
}

// ============================================================================
// Partitioning
// ============================================================================

#[test]
fn test_partition_by_hour_switches_forward() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path()).with_partition_by(PartitionBy::Hour);
    let scheduler = MeasurementScheduler::new(config).unwrap();

    // 2016-06-13T17:43:50, one hour later, then back into the first hour.
    submit(&scheduler, "weather temperature=1 1465839830000000000");
    submit(&scheduler, "weather temperature=2 1465843430000000000");
    submit(&scheduler, "weather temperature=3 1465839831000000000");
    scheduler.commit_all().unwrap();

    assert_eq!(scheduler.stats().records_applied(), 2);
    assert_eq!(scheduler.stats().records_dropped(), 1);
    scheduler.shutdown(ShutdownMode::Drain);

    let table_dir = temp_dir.path().join("weather");
    assert!(table_dir.join("2016-06-13T17").is_dir());
    assert!(table_dir.join("2016-06-13T18").is_dir());

    let writer = open_table(temp_dir.path(), "weather");
    assert_eq!(writer.partition_name(), Some("2016-06-13T18"));
    assert_eq!(writer.row_count(), 1);
    assert_eq!(writer.max_timestamp(), Some(1_465_843_430_000_000));
}
