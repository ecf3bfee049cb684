use strata_config::{init_tracing, LoggingConfig};

#[test]
fn init_tracing_installs_once_and_writes_file() {
    let temp = tempfile::tempdir().unwrap();
    let log_path = temp.path().join("strata.log");
    let config = LoggingConfig {
        level: "strata.test=info".into(),
        json: true,
        stderr: false,
        file: Some(log_path.clone()),
    };

    assert!(init_tracing(&config));
    assert!(!init_tracing(&config));

    tracing::info!(target: "strata.test", root = "file:///work/src/", "pass committed");

    let text = std::fs::read_to_string(&log_path).unwrap();
    let line = text.lines().last().expect("log line");
    assert!(line.starts_with('{'), "{line}");
    assert!(line.contains("pass committed"), "{line}");
}
