use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fragment::DEFAULT_FRAGMENT_PATTERN;
use crate::report::ReportOptions;
use crate::strategy::ExchangeKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    /// Root of the shared store as seen from every container.
    pub share: PathBuf,
    pub run_segment: String,
    #[serde(default)]
    pub exchange: ExchangeKind,
    #[serde(default = "default_fragment_pattern")]
    pub fragment_pattern: String,
    #[serde(default)]
    pub style: Option<StyleSpec>,
    pub variants: Vec<VariantSpec>,
    #[serde(default)]
    pub report: ReportSpec,
}

fn default_fragment_pattern() -> String {
    DEFAULT_FRAGMENT_PATTERN.to_string()
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;
        Ok(config)
    }

    /// The first variant's image also runs the style and report steps.
    pub fn base_image(&self) -> Option<&str> {
        self.variants.first().map(|variant| variant.image.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StyleSpec {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VariantSpec {
    pub name: String,
    pub image: String,
    pub test_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportSpec {
    #[serde(default = "default_true")]
    pub skip_covered: bool,
    #[serde(default = "default_true")]
    pub show_missing: bool,
    #[serde(default)]
    pub source_root: Option<PathBuf>,
    #[serde(default)]
    pub fail_under: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl Default for ReportSpec {
    fn default() -> Self {
        Self {
            skip_covered: true,
            show_missing: true,
            source_root: None,
            fail_under: None,
        }
    }
}

impl ReportSpec {
    pub fn options(&self) -> ReportOptions {
        ReportOptions {
            skip_covered: self.skip_covered,
            show_missing: self.show_missing,
            source_root: self.source_root.clone(),
        }
    }
}
