use std::fs;
use std::sync::Arc;

use coverage_relay::report::ReportOptions;
use coverage_relay::store::PutMode;
use coverage_relay::strategy::tick_key;
use coverage_relay::{
    CollectMode, CoverageData, ExchangeError, FileCoverage, FragmentCollector, MemoryStore,
    SharedStore,
};
use tempfile::tempdir;

fn fragment_for(file: &str, executed: &[u32]) -> Vec<u8> {
    let mut data = CoverageData::new();
    data.record(file, FileCoverage::new(1..=8, executed.iter().copied()));
    data.to_vec().unwrap()
}

#[test]
fn corrupted_fragment_is_skipped_and_report_completes() {
    let store = MemoryStore::new();
    let payloads = [
        fragment_for("a.py", &[1, 2, 3, 4]),
        fragment_for("b.py", &[1, 2]),
        b"{\"version\": 1, \"files\": {\"broken.py\": ".to_vec(),
        fragment_for("c.py", &[1, 2, 3, 4, 5, 6, 7, 8]),
        fragment_for("d.py", &[7, 8]),
    ];
    for (tick, payload) in payloads.iter().enumerate() {
        store
            .put(&tick_key(tick as u32).unwrap(), payload, PutMode::CreateNew)
            .unwrap();
    }

    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store),
        CollectMode::Count { expected: 5 },
        temp.path(),
    )
    .unwrap()
    .with_report_options(ReportOptions {
        skip_covered: true,
        show_missing: true,
        source_root: None,
    });

    let mut sink = Vec::new();
    let outcome = collector.run(&mut sink).unwrap();

    let issues: Vec<_> = outcome.issues().collect();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].subject, ".coverage.2");
    assert_eq!(outcome.merge.merged.len(), 4);
    // The corrupt input stays behind for inspection.
    assert!(temp.path().join(".coverage.2").exists());

    let text = String::from_utf8(sink).unwrap();
    assert!(text.contains("a.py"));
    assert!(text.contains("b.py"));
    assert!(text.contains("d.py"));
    assert!(!text.contains("broken.py"));
    assert!(text.contains("1 file skipped due to complete coverage."));

    let d_row: Vec<_> = text
        .lines()
        .find(|line| line.starts_with("d.py"))
        .unwrap()
        .split_whitespace()
        .collect();
    assert_eq!(d_row, vec!["d.py", "8", "6", "25%", "1-6"]);

    let collector_metrics = collector.metrics().snapshot();
    assert_eq!(collector_metrics.file_issues, 1);
    assert_eq!(collector_metrics.fragments_collected, 5);
}

#[test]
fn all_fragments_corrupt_is_a_report_failure() {
    let store = MemoryStore::new();
    for tick in 0..3u32 {
        store
            .put(&tick_key(tick).unwrap(), b"garbage", PutMode::CreateNew)
            .unwrap();
    }

    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store),
        CollectMode::Count { expected: 3 },
        temp.path(),
    )
    .unwrap();
    let err = collector.run(Vec::new()).unwrap_err();
    assert!(matches!(err, ExchangeError::ReportFailure(_)), "{err}");
}

#[test]
fn merge_is_idempotent_over_the_same_fragment_set() {
    let temp = tempdir().unwrap();
    let run = |workdir: &std::path::Path| {
        let store = MemoryStore::new();
        for (tick, payload) in [
            fragment_for("a.py", &[1, 3]),
            fragment_for("a.py", &[3, 5]),
            fragment_for("b.py", &[2]),
        ]
        .iter()
        .enumerate()
        {
            store
                .put(&tick_key(tick as u32).unwrap(), payload, PutMode::CreateNew)
                .unwrap();
        }
        FragmentCollector::new(Arc::new(store), CollectMode::Count { expected: 3 }, workdir)
            .unwrap()
            .run(Vec::new())
            .unwrap()
    };

    let first = run(&temp.path().join("first"));
    let second = run(&temp.path().join("second"));
    assert_eq!(first.merge.database, second.merge.database);
    assert_eq!(first.report.total_statements, second.report.total_statements);
    assert_eq!(first.report.total_missed, second.report.total_missed);
    assert_eq!(first.report.total_missed, 5 + 7);
}

#[test]
fn fail_under_rejects_low_totals_after_reporting() {
    let store = MemoryStore::new();
    store
        .put(&tick_key(0).unwrap(), &fragment_for("a.py", &[1, 2]), PutMode::CreateNew)
        .unwrap();

    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store),
        CollectMode::Count { expected: 1 },
        temp.path(),
    )
    .unwrap()
    .with_fail_under(Some(80.0));

    let mut sink = Vec::new();
    let err = collector.run(&mut sink).unwrap_err();
    assert!(matches!(err, ExchangeError::BelowThreshold { .. }), "{err}");
    assert!(String::from_utf8(sink).unwrap().contains("TOTAL"));
    assert!(fs::metadata(temp.path().join(".coverage")).is_ok());
}

fn store_with_ticks(ticks: impl IntoIterator<Item = u32>) -> MemoryStore {
    let store = MemoryStore::new();
    for tick in ticks {
        store
            .put(
                &tick_key(tick).unwrap(),
                &fragment_for(&format!("mod_{tick}.py"), &[1, 2]),
                PutMode::CreateNew,
            )
            .unwrap();
    }
    store
}

#[test]
fn count_mode_merges_every_tick_even_when_the_pattern_is_narrower() {
    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store_with_ticks(0..3)),
        CollectMode::Count { expected: 3 },
        temp.path(),
    )
    .unwrap()
    .with_pattern(".coverage.[01]")
    .unwrap();

    let outcome = collector.run(Vec::new()).unwrap();
    assert_eq!(outcome.retrieved.len(), 3);
    assert_eq!(outcome.merge.merged.len(), 3);
    assert!(outcome.merge.database.files.contains_key("mod_2.py"));
    assert_eq!(outcome.report.total_statements, 3 * 8);
}

#[test]
fn count_mode_orders_ticks_numerically() {
    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store_with_ticks(0..12)),
        CollectMode::Count { expected: 12 },
        temp.path(),
    )
    .unwrap();

    let outcome = collector.run(Vec::new()).unwrap();
    assert_eq!(outcome.retrieved.len(), 12);
    assert_eq!(outcome.retrieved[10], temp.path().join(".coverage.10"));
    assert_eq!(outcome.retrieved[11], temp.path().join(".coverage.11"));
    assert_eq!(outcome.merge.merged.len(), 12);
    assert!(outcome.merge.database.files.contains_key("mod_10.py"));
    assert!(outcome.merge.database.files.contains_key("mod_11.py"));
}

#[test]
fn count_mode_detects_a_missing_two_digit_tick() {
    let temp = tempdir().unwrap();
    let collector = FragmentCollector::new(
        Arc::new(store_with_ticks((0..12).filter(|tick| *tick != 10))),
        CollectMode::Count { expected: 12 },
        temp.path(),
    )
    .unwrap();

    match collector.run(Vec::new()).unwrap_err() {
        ExchangeError::MissingFragment { key } => assert_eq!(key, "coverage.10"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!temp.path().join(".coverage.0").exists());
}
