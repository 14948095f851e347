//! Tests for `src/logging.rs`.

use campaign_dispatch::logging::{LoggingGuard, DEFAULT_DIRECTIVE, LOG_FILE_PREFIX};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("nested").join("logs");
    assert!(!logs_dir.exists());

    // Only call in this binary that installs the global subscriber.
    let guard = campaign_dispatch::logging::init_production(&logs_dir, DEFAULT_DIRECTIVE);
    assert!(guard.is_ok());
    assert!(logs_dir.exists(), "logs directory should be created");

    let span = tracing::info_span!("poll", task = "scheduler");
    span.in_scope(|| tracing::info!(target: "campaign_dispatch::engine", "cycle finished"));
    drop(guard);

    let files: Vec<_> = std::fs::read_dir(&logs_dir)
        .expect("read logs dir")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .collect();
    assert_eq!(files.len(), 1);
    let contents = std::fs::read_to_string(files[0].path()).expect("read log file");
    let record: serde_json::Value = contents
        .lines()
        .find(|line| line.contains("cycle finished"))
        .map(|line| serde_json::from_str(line).expect("json line"))
        .expect("record written");
    assert_eq!(record["span"]["task"], "scheduler");
    assert_eq!(record["target"], "campaign_dispatch::engine");
}
