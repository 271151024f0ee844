use std::fs;
use std::time::Duration;

use log::LevelFilter;

/// One test per process: the global logger can only be installed once.
#[test]
fn async_logger_writes_formatted_records() {
    let dir = tempfile::tempdir().unwrap();
    let basename = dir.path().join("engine");

    let sink = hive_net::logger::init_async(
        basename.clone(),
        hive_net::logger::DEFAULT_ROLL_SIZE,
        Duration::from_millis(50),
    )
    .unwrap();
    hive_net::logger::set_level(LevelFilter::Trace);

    log::info!("engine started");
    log::warn!("slow peer count={}", 3);
    sink.stop();

    let content = fs::read_to_string(dir.path().join("engine.log")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    assert!(lines[0].contains("[  INFO] engine started"));
    assert!(lines[1].contains("[  WARN] slow peer count=3"));
    assert!(lines[0].contains(&format!("[{:>5}]", std::process::id())));

    // Source location tail: "- logging.rs:<line>"
    let (_, location) = lines[0].rsplit_once(" - ").unwrap();
    let (file, line) = location.rsplit_once(':').unwrap();
    assert_eq!(file, "logging.rs");
    assert!(line.parse::<u32>().unwrap() > 0);

    // Timestamp prefix: "YYYYMMDD HH:MM:SS.mmm"
    let ts = &lines[0][..21];
    assert_eq!(&ts[8..9], " ");
    assert!(ts[..8].bytes().all(|b| b.is_ascii_digit()));
}
