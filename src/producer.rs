use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use glob::Pattern;
use tracing::{info, instrument, warn};

use crate::error::{ExchangeError, Result};
use crate::fragment::{CoverageData, DEFAULT_FRAGMENT_PATTERN, compile_pattern, locate_fragments};
use crate::observability::ExchangeMetrics;
use crate::store::{PutOutcome, SharedStore, StoreKey, content_digest};
use crate::strategy::ExchangeStrategy;

/// The command that runs the test suite under the coverage instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    program: String,
    args: Vec<String>,
}

impl TestCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", ["-c".to_string(), script.into()])
    }

    fn run(&self, workdir: &Path) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workdir)
            .status()
            .map_err(|err| ExchangeError::TestFailure {
                command: self.to_string(),
                reason: format!("failed to start: {err}"),
            })?;

        if status.success() {
            return Ok(());
        }
        let reason = match status.code() {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        };
        Err(ExchangeError::TestFailure {
            command: self.to_string(),
            reason,
        })
    }
}

impl fmt::Display for TestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub sources: Vec<PathBuf>,
    pub key: StoreKey,
    pub bytes: u64,
    pub digest: String,
    pub outcome: PutOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub records: Vec<TransferRecord>,
}

impl TransferReport {
    pub fn keys(&self) -> Vec<&StoreKey> {
        self.records.iter().map(|record| &record.key).collect()
    }
}

pub struct FragmentProducer {
    command: TestCommand,
    workdir: PathBuf,
    pattern: Pattern,
    strategy: ExchangeStrategy,
    store: Arc<dyn SharedStore>,
    metrics: ExchangeMetrics,
}

impl FragmentProducer {
    pub fn new(
        command: TestCommand,
        workdir: impl Into<PathBuf>,
        strategy: ExchangeStrategy,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self> {
        Ok(Self {
            command,
            workdir: workdir.into(),
            pattern: compile_pattern(DEFAULT_FRAGMENT_PATTERN)?,
            strategy,
            store,
            metrics: ExchangeMetrics::new(),
        })
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        self.pattern = compile_pattern(pattern)?;
        Ok(self)
    }

    pub fn metrics(&self) -> ExchangeMetrics {
        self.metrics.clone()
    }

    #[instrument(skip(self), fields(command = %self.command, strategy = ?self.strategy))]
    pub fn run(&self) -> Result<TransferReport> {
        {
            let _timer = self.metrics.start_phase("test");
            info!(workdir = %self.workdir.display(), "Running test command");
            self.command.run(&self.workdir)?;
        }
        self.transfer()
    }

    pub fn transfer(&self) -> Result<TransferReport> {
        let _timer = self.metrics.start_phase("transfer");
        let fragments = locate_fragments(&self.workdir, &self.pattern)?;
        if fragments.is_empty() {
            warn!(
                pattern = self.pattern.as_str(),
                workdir = %self.workdir.display(),
                "Test command produced no coverage fragments"
            );
            return Ok(TransferReport::default());
        }

        let mut report = TransferReport::default();
        match &self.strategy {
            ExchangeStrategy::PathPartition { .. } => {
                for path in &fragments {
                    let data = fs::read(path).map_err(|err| ExchangeError::io(path, err))?;
                    let key = self
                        .strategy
                        .key_for(&file_name(path))
                        .map_err(|err| transfer_failure(path, &file_name(path), err))?;
                    report.records.push(self.put(vec![path.clone()], key, &data)?);
                }
            }
            ExchangeStrategy::ExplicitTick { .. } => {
                let key = self
                    .strategy
                    .key_for("")
                    .map_err(|err| transfer_failure(&fragments[0], "", err))?;
                let data = self.single_payload(&fragments, &key)?;
                report.records.push(self.put(fragments.clone(), key, &data)?);
            }
        }

        Ok(report)
    }

    /// A tick owns one key, so several local fragments are merged first.
    fn single_payload(&self, fragments: &[PathBuf], key: &StoreKey) -> Result<Vec<u8>> {
        if let [only] = fragments {
            return fs::read(only).map_err(|err| ExchangeError::io(only, err));
        }

        let mut merged = CoverageData::new();
        for path in fragments {
            let bytes = fs::read(path).map_err(|err| ExchangeError::io(path, err))?;
            let data = CoverageData::from_slice(&bytes)
                .map_err(|err| transfer_failure(path, key.as_str(), err))?;
            merged.merge(&data);
        }
        info!(
            fragments = fragments.len(),
            key = %key,
            "Merged local fragments for a single tick"
        );
        merged
            .to_vec()
            .map_err(|err| transfer_failure(&fragments[0], key.as_str(), err))
    }

    fn put(&self, sources: Vec<PathBuf>, key: StoreKey, data: &[u8]) -> Result<TransferRecord> {
        let outcome = self
            .store
            .put(&key, data, self.strategy.put_mode())
            .map_err(|err| transfer_failure(&sources[0], key.as_str(), err))?;

        for source in &sources {
            fs::remove_file(source).map_err(|err| ExchangeError::io(source, err))?;
        }

        let record = TransferRecord {
            sources,
            digest: content_digest(data),
            bytes: data.len() as u64,
            key,
            outcome,
        };
        self.metrics
            .record_transfer(record.bytes, outcome == PutOutcome::Unchanged);
        info!(
            key = %record.key,
            bytes = record.bytes,
            digest = %record.digest,
            ?outcome,
            "Fragment transferred"
        );
        Ok(record)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn transfer_failure(path: &Path, key: &str, err: impl fmt::Display) -> ExchangeError {
    ExchangeError::TransferFailure {
        fragment: path.to_path_buf(),
        key: key.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{FileCoverage, FragmentIdentity, write_fragment};
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn sample(lines: &[u32]) -> CoverageData {
        let mut data = CoverageData::new();
        data.record("lib.py", FileCoverage::new(1..=10, lines.iter().copied()));
        data
    }

    #[test]
    fn command_display_joins_args() {
        let command = TestCommand::new("python", ["-m", "pytest"]);
        assert_eq!(command.to_string(), "python -m pytest");
        assert_eq!(
            TestCommand::from_argv(&["pytest".to_string()]),
            Some(TestCommand::new("pytest", Vec::<String>::new()))
        );
        assert_eq!(TestCommand::from_argv(&[]), None);
    }

    #[test]
    fn tick_mode_merges_multiple_local_fragments() {
        let temp = tempdir().unwrap();
        write_fragment(
            temp.path(),
            &FragmentIdentity::parallel("ci", "box", 10, 1),
            &sample(&[1, 2]),
        )
        .unwrap();
        write_fragment(
            temp.path(),
            &FragmentIdentity::parallel("ci", "box", 11, 1),
            &sample(&[3]),
        )
        .unwrap();

        let store = MemoryStore::new();
        let producer = FragmentProducer::new(
            TestCommand::shell("true"),
            temp.path(),
            ExchangeStrategy::explicit_tick(2),
            Arc::new(store.clone()),
        )
        .unwrap();
        let report = producer.transfer().unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].sources.len(), 2);
        let stored = store.get(&StoreKey::new("coverage.2").unwrap()).unwrap();
        let data = CoverageData::from_slice(&stored).unwrap();
        assert_eq!(data.files["lib.py"].executed.len(), 3);
        assert!(locate_fragments(temp.path(), &compile_pattern(".coverage.*").unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn no_fragments_is_not_an_error() {
        let temp = tempdir().unwrap();
        let store = MemoryStore::new();
        let producer = FragmentProducer::new(
            TestCommand::shell("true"),
            temp.path(),
            ExchangeStrategy::path_partition("run"),
            Arc::new(store.clone()),
        )
        .unwrap();
        let report = producer.run().unwrap();
        assert!(report.records.is_empty());
        assert!(store.is_empty());
    }
}
