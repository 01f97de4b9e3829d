use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ExchangeError, Result};

pub const FRAGMENT_FORMAT_VERSION: u32 = 1;

/// Glob matched against file names written by the instrument in parallel mode.
pub const DEFAULT_FRAGMENT_PATTERN: &str = ".coverage.*";

/// File name of the merged database inside the collector's working directory.
pub const DATABASE_FILE: &str = ".coverage";

const FRAGMENT_PREFIX: &str = ".coverage.";

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("malformed coverage data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported coverage data version {0}")]
    UnsupportedVersion(u32),

    #[error("file '{file}' records executed line {line} which is not a statement")]
    UnknownLine { file: String, line: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    pub statements: BTreeSet<u32>,
    #[serde(default)]
    pub executed: BTreeSet<u32>,
}

impl FileCoverage {
    pub fn new(
        statements: impl IntoIterator<Item = u32>,
        executed: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            statements: statements.into_iter().collect(),
            executed: executed.into_iter().collect(),
        }
    }

    pub fn missing(&self) -> BTreeSet<u32> {
        self.statements
            .difference(&self.executed)
            .copied()
            .collect()
    }

    fn merge(&mut self, other: &FileCoverage) {
        self.statements.extend(other.statements.iter().copied());
        self.executed.extend(other.executed.iter().copied());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageData {
    pub version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, FileCoverage>,
}

impl Default for CoverageData {
    fn default() -> Self {
        Self {
            version: FRAGMENT_FORMAT_VERSION,
            files: BTreeMap::new(),
        }
    }
}

impl CoverageData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, FragmentError> {
        let data: CoverageData = serde_json::from_slice(bytes)?;
        data.validate()?;
        Ok(data)
    }

    pub fn to_vec(&self) -> std::result::Result<Vec<u8>, FragmentError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> std::result::Result<(), FragmentError> {
        if self.version != FRAGMENT_FORMAT_VERSION {
            return Err(FragmentError::UnsupportedVersion(self.version));
        }
        for (file, coverage) in &self.files {
            if let Some(line) = coverage
                .executed
                .iter()
                .find(|line| !coverage.statements.contains(line))
            {
                return Err(FragmentError::UnknownLine {
                    file: file.clone(),
                    line: *line,
                });
            }
        }
        Ok(())
    }

    pub fn record(&mut self, file: impl Into<String>, coverage: FileCoverage) -> &mut Self {
        self.files
            .entry(file.into())
            .or_default()
            .merge(&coverage);
        self
    }

    /// Union `other` into `self`. Applying the same data twice changes nothing.
    pub fn merge(&mut self, other: &CoverageData) {
        for (file, coverage) in &other.files {
            self.files.entry(file.clone()).or_default().merge(coverage);
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| ExchangeError::io(path, err))?;
        CoverageData::from_slice(&bytes).map_err(|err| {
            ExchangeError::ReportFailure(format!("{}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self
            .to_vec()
            .map_err(|err| ExchangeError::ReportFailure(err.to_string()))?;
        fs::write(path, bytes).map_err(|err| ExchangeError::io(path, err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FragmentIdentity {
    /// `.coverage.<user>.<host>.<pid>.<counter>` as written by the instrument.
    Parallel {
        user: String,
        host: String,
        pid: u32,
        counter: u32,
    },
    /// `.coverage.<N>` materialized from an explicit tick.
    Tick(u32),
}

impl FragmentIdentity {
    pub fn parallel(
        user: impl Into<String>,
        host: impl Into<String>,
        pid: u32,
        counter: u32,
    ) -> Self {
        FragmentIdentity::Parallel {
            user: user.into(),
            host: host.into(),
            pid,
            counter,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{FRAGMENT_PREFIX}{}", self.suffix())
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let suffix = file_name.strip_prefix(FRAGMENT_PREFIX)?;
        if let Ok(tick) = suffix.parse::<u32>() {
            return Some(FragmentIdentity::Tick(tick));
        }

        // Hosts may contain dots, so peel the numeric fields off the right.
        let mut parts = suffix.rsplitn(3, '.');
        let counter = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let (user, host) = parts.next()?.split_once('.')?;
        if user.is_empty() || host.is_empty() {
            return None;
        }
        Some(FragmentIdentity::parallel(user, host, pid, counter))
    }

    fn suffix(&self) -> String {
        match self {
            FragmentIdentity::Parallel {
                user,
                host,
                pid,
                counter,
            } => format!("{user}.{host}.{pid}.{counter:06}"),
            FragmentIdentity::Tick(tick) => tick.to_string(),
        }
    }
}

impl fmt::Display for FragmentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

pub fn write_fragment(
    dir: &Path,
    identity: &FragmentIdentity,
    data: &CoverageData,
) -> Result<PathBuf> {
    let path = dir.join(identity.file_name());
    data.save(&path)?;
    Ok(path)
}

pub fn compile_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|err| ExchangeError::Pattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    })
}

/// Regular files directly inside `dir` whose name matches `pattern`, sorted by name.
pub fn locate_fragments(dir: &Path, pattern: &Pattern) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|err| ExchangeError::io(dir, err))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ExchangeError::io(dir, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| ExchangeError::io(entry.path(), err))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_str().is_some_and(|name| pattern.matches(name)) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}
