use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use glob::Pattern;
use tracing::{info, instrument, warn};

use crate::database::{MergeOutcome, combine, combine_paths};
use crate::error::{ExchangeError, FileReportIssue, Result, StoreError};
use crate::fragment::{DEFAULT_FRAGMENT_PATTERN, compile_pattern};
use crate::observability::ExchangeMetrics;
use crate::report::{CoverageReport, ReportOptions};
use crate::store::{SharedStore, StoreKey};
use crate::strategy::{CollectMode, segment_key, tick_file_name, tick_key};

#[derive(Debug)]
pub struct CollectOutcome {
    pub retrieved: Vec<PathBuf>,
    pub merge: MergeOutcome,
    pub report: CoverageReport,
}

impl CollectOutcome {
    pub fn issues(&self) -> impl Iterator<Item = &FileReportIssue> {
        self.merge.issues.iter().chain(self.report.issues.iter())
    }
}

/// Gathers fragments from the shared store once every producer has finished,
/// merges them and renders the report.
pub struct FragmentCollector {
    store: Arc<dyn SharedStore>,
    mode: CollectMode,
    workdir: PathBuf,
    pattern: Pattern,
    options: ReportOptions,
    fail_under: Option<f64>,
    keep_fragments: bool,
    metrics: ExchangeMetrics,
}

impl FragmentCollector {
    pub fn new(
        store: Arc<dyn SharedStore>,
        mode: CollectMode,
        workdir: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            mode,
            workdir: workdir.into(),
            pattern: compile_pattern(DEFAULT_FRAGMENT_PATTERN)?,
            options: ReportOptions::default(),
            fail_under: None,
            keep_fragments: false,
            metrics: ExchangeMetrics::new(),
        })
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self> {
        self.pattern = compile_pattern(pattern)?;
        Ok(self)
    }

    pub fn with_report_options(mut self, options: ReportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_fail_under(mut self, fail_under: Option<f64>) -> Self {
        self.fail_under = fail_under;
        self
    }

    pub fn keep_fragments(mut self, keep: bool) -> Self {
        self.keep_fragments = keep;
        self
    }

    pub fn metrics(&self) -> ExchangeMetrics {
        self.metrics.clone()
    }

    #[instrument(skip(self, sink), fields(mode = ?self.mode, workdir = %self.workdir.display()))]
    pub fn run<W: Write>(&self, sink: W) -> Result<CollectOutcome> {
        let retrieved = self.retrieve()?;
        let merge = match self.mode {
            // Every tick was fetched, so every tick is merged whatever the pattern says.
            CollectMode::Count { .. } => combine_paths(
                &self.workdir,
                &retrieved,
                self.keep_fragments,
                &self.metrics,
            )?,
            CollectMode::Wildcard { .. } => combine(
                &self.workdir,
                &self.pattern,
                self.keep_fragments,
                &self.metrics,
            )?,
        };

        let report = {
            let _timer = self.metrics.start_phase("report");
            CoverageReport::build(&merge.database, &self.options)
        };
        for issue in &report.issues {
            self.metrics.record_file_issue();
            warn!(%issue, "File omitted from coverage report");
        }
        report
            .write_to(sink)
            .map_err(|err| ExchangeError::ReportFailure(format!("failed to write report: {err}")))?;

        let total = report.total_percent();
        info!(
            statements = report.total_statements,
            missed = report.total_missed,
            percent = total,
            "Coverage report emitted"
        );
        if let Some(required) = self.fail_under
            && total < required
        {
            return Err(ExchangeError::BelowThreshold {
                actual: total,
                required,
            });
        }

        Ok(CollectOutcome {
            retrieved,
            merge,
            report,
        })
    }

    pub fn retrieve(&self) -> Result<Vec<PathBuf>> {
        let _timer = self.metrics.start_phase("retrieve");
        fs::create_dir_all(&self.workdir).map_err(|err| ExchangeError::io(&self.workdir, err))?;

        let retrieved = match &self.mode {
            CollectMode::Wildcard { run_segment } => self.retrieve_wildcard(run_segment)?,
            CollectMode::Count { expected } => self.retrieve_count(*expected)?,
        };
        info!(fragments = retrieved.len(), "Fragments retrieved");
        Ok(retrieved)
    }

    fn retrieve_wildcard(&self, run_segment: &str) -> Result<Vec<PathBuf>> {
        let dir = segment_key(run_segment)?;
        let keys: Vec<StoreKey> = self
            .store
            .list(Some(&dir))?
            .into_iter()
            .filter(|key| self.pattern.matches(key.file_name()))
            .collect();

        let mut retrieved = Vec::with_capacity(keys.len());
        for key in keys {
            let data = self.store.get(&key)?;
            let local = self.workdir.join(key.file_name());
            fs::write(&local, &data).map_err(|err| ExchangeError::io(&local, err))?;
            // Each entry is read at most once.
            self.store.remove(&key)?;
            self.metrics.record_collected();
            retrieved.push(local);
        }
        Ok(retrieved)
    }

    fn retrieve_count(&self, expected: u32) -> Result<Vec<PathBuf>> {
        // Fetch everything first so a missing tick leaves the workdir untouched.
        let mut payloads = Vec::with_capacity(expected as usize);
        for tick in 0..expected {
            let key = tick_key(tick)?;
            let data = self.store.get(&key).map_err(|err| match err {
                StoreError::NotFound(_) => ExchangeError::MissingFragment {
                    key: key.to_string(),
                },
                other => ExchangeError::Store(other),
            })?;
            payloads.push((tick, data));
        }

        let mut retrieved = Vec::with_capacity(payloads.len());
        for (tick, data) in payloads {
            let local = self.workdir.join(tick_file_name(tick));
            fs::write(&local, &data).map_err(|err| ExchangeError::io(&local, err))?;
            self.metrics.record_collected();
            retrieved.push(local);
        }
        Ok(retrieved)
    }
}
