use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{info, instrument, warn};

use crate::error::{ExchangeError, FileReportIssue, Result};
use crate::fragment::{CoverageData, DATABASE_FILE, locate_fragments};
use crate::observability::ExchangeMetrics;

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub database: CoverageData,
    pub merged: Vec<PathBuf>,
    pub issues: Vec<FileReportIssue>,
}

/// Unreadable or invalid fragments become issues and are skipped. The merge
/// fails only when no fragment at all could be used.
pub fn merge_fragments(paths: &[PathBuf]) -> Result<MergeOutcome> {
    if paths.is_empty() {
        return Err(ExchangeError::ReportFailure(
            "no coverage fragments to combine".into(),
        ));
    }

    let mut database = CoverageData::new();
    let mut merged = Vec::with_capacity(paths.len());
    let mut issues = Vec::new();

    for path in paths {
        let subject = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let parsed = fs::read(path)
            .map_err(|err| err.to_string())
            .and_then(|bytes| CoverageData::from_slice(&bytes).map_err(|err| err.to_string()));
        match parsed {
            Ok(fragment) => {
                database.merge(&fragment);
                merged.push(path.clone());
            }
            Err(reason) => {
                warn!(fragment = %subject, %reason, "Skipping unreadable coverage fragment");
                issues.push(FileReportIssue::new(subject, reason));
            }
        }
    }

    if merged.is_empty() {
        return Err(ExchangeError::ReportFailure(format!(
            "none of {} fragment(s) contained valid coverage data",
            paths.len()
        )));
    }

    Ok(MergeOutcome {
        database,
        merged,
        issues,
    })
}

/// Combine every fragment in `dir` into `<dir>/.coverage`.
///
/// Merged fragment files are deleted unless `keep_fragments` is set; skipped
/// ones are always left in place for inspection.
pub fn combine(
    dir: &Path,
    pattern: &Pattern,
    keep_fragments: bool,
    metrics: &ExchangeMetrics,
) -> Result<MergeOutcome> {
    let paths = locate_fragments(dir, pattern)?;
    if paths.is_empty() {
        return Err(ExchangeError::ReportFailure(format!(
            "no fragments matching '{}' found in {}",
            pattern.as_str(),
            dir.display()
        )));
    }
    combine_paths(dir, &paths, keep_fragments, metrics)
}

/// Like [`combine`], but over an explicit list of fragment files.
#[instrument(skip(dir, paths, metrics), fields(dir = %dir.display(), fragments = paths.len()))]
pub fn combine_paths(
    dir: &Path,
    paths: &[PathBuf],
    keep_fragments: bool,
    metrics: &ExchangeMetrics,
) -> Result<MergeOutcome> {
    let _timer = metrics.start_phase("merge");
    let outcome = merge_fragments(paths)?;
    for _ in &outcome.issues {
        metrics.record_file_issue();
    }
    metrics.record_merged(outcome.merged.len() as u64);

    let database_path = dir.join(DATABASE_FILE);
    outcome.database.save(&database_path)?;

    if !keep_fragments {
        for path in &outcome.merged {
            fs::remove_file(path).map_err(|err| ExchangeError::io(path, err))?;
        }
    }

    info!(
        merged = outcome.merged.len(),
        skipped = outcome.issues.len(),
        files = outcome.database.files.len(),
        database = %database_path.display(),
        "Coverage data combined"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FileCoverage, FragmentIdentity, compile_pattern, write_fragment};
    use tempfile::tempdir;

    #[test]
    fn combine_writes_database_and_removes_inputs() {
        let temp = tempdir().unwrap();
        let mut first = CoverageData::new();
        first.record("pkg/a.py", FileCoverage::new([1, 2, 3, 4], [1, 2]));
        let mut second = CoverageData::new();
        second.record("pkg/a.py", FileCoverage::new([1, 2, 3, 4], [3]));
        write_fragment(temp.path(), &FragmentIdentity::Tick(0), &first).unwrap();
        write_fragment(temp.path(), &FragmentIdentity::Tick(1), &second).unwrap();

        let pattern = compile_pattern(".coverage.*").unwrap();
        let metrics = ExchangeMetrics::new();
        let outcome = combine(temp.path(), &pattern, false, &metrics).unwrap();

        assert_eq!(outcome.merged.len(), 2);
        assert!(outcome.issues.is_empty());
        assert!(!temp.path().join(".coverage.0").exists());
        let stored = CoverageData::load(&temp.path().join(DATABASE_FILE)).unwrap();
        assert_eq!(stored, outcome.database);
        assert_eq!(stored.files["pkg/a.py"].missing().len(), 1);
        assert_eq!(metrics.snapshot().fragments_merged, 2);
    }

    #[test]
    fn empty_directory_is_a_report_failure() {
        let temp = tempdir().unwrap();
        let pattern = compile_pattern(".coverage.*").unwrap();
        let err = combine(temp.path(), &pattern, false, &ExchangeMetrics::new()).unwrap_err();
        assert!(matches!(err, ExchangeError::ReportFailure(_)));
    }

    #[test]
    fn all_corrupt_fragments_fail_the_merge() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".coverage.0");
        fs::write(&path, b"not json").unwrap();
        let err = merge_fragments(&[path]).unwrap_err();
        assert!(matches!(err, ExchangeError::ReportFailure(_)));
    }

    #[test]
    fn combine_paths_merges_only_the_listed_files() {
        let temp = tempdir().unwrap();
        let mut data = CoverageData::new();
        data.record("a.py", FileCoverage::new([1, 2], [1]));
        for tick in 0..3 {
            write_fragment(temp.path(), &FragmentIdentity::Tick(tick), &data).unwrap();
        }
        let listed = vec![temp.path().join(".coverage.0"), temp.path().join(".coverage.2")];

        let outcome = combine_paths(temp.path(), &listed, false, &ExchangeMetrics::new()).unwrap();
        assert_eq!(outcome.merged, listed);
        assert!(temp.path().join(".coverage.1").exists());
        assert!(temp.path().join(DATABASE_FILE).is_file());
    }
}
