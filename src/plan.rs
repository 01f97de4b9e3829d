use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::strategy::ExchangeKind;
use crate::validation::validate_config;

const RELAY_BIN: &str = env!("CARGO_PKG_NAME");
const STYLE_STEP: &str = "Style Guidelines";
const TESTS_GROUP: &str = "Tests";
const REPORT_STEP: &str = "Test Code Coverage";

/// Serial pipeline: style check, parallel producers, then the collector.
///
/// The plan only describes the steps; running them belongs to the orchestrator.
#[derive(Debug, Serialize)]
pub struct PipelinePlan {
    pub config_version: u32,
    pub generated_at: DateTime<Utc>,
    pub share: String,
    pub exchange: ExchangeKind,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Serialize)]
pub struct PlanStep {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub command_hash: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
}

impl PlanStep {
    fn new(name: String, group: Option<&str>, image: &str, command: Vec<String>) -> Self {
        Self {
            command_hash: hash_command(&name, &command),
            name,
            group: group.map(str::to_string),
            image: image.to_string(),
            command,
            after: Vec::new(),
        }
    }
}

pub fn build_plan(config: &PipelineConfig) -> Result<PipelinePlan> {
    let validation = validate_config(config);
    if !validation.is_ok() {
        bail!(
            "Cannot build pipeline plan: {}",
            validation.errors.join("; ")
        );
    }
    let base_image = config
        .base_image()
        .context("Pipeline has no variants to take a base image from")?;
    let share = config.share.to_string_lossy().to_string();

    let mut steps = Vec::with_capacity(config.variants.len() + 2);
    let mut barrier = Vec::new();

    if let Some(style) = &config.style {
        steps.push(PlanStep::new(
            STYLE_STEP.to_string(),
            None,
            base_image,
            style.command.clone(),
        ));
        barrier.push(STYLE_STEP.to_string());
    }

    let mut test_steps = Vec::with_capacity(config.variants.len());
    for (tick, variant) in config.variants.iter().enumerate() {
        let mut command = vec![
            RELAY_BIN.to_string(),
            "produce".into(),
            "--store".into(),
            share.clone(),
            "--pattern".into(),
            config.fragment_pattern.clone(),
        ];
        command.extend(identity_args(config, tick));
        command.push("--".into());
        command.extend(variant.test_command.iter().cloned());

        let mut step = PlanStep::new(
            format!("{} Coverage", variant.name),
            Some(TESTS_GROUP),
            &variant.image,
            command,
        );
        step.after = barrier.clone();
        test_steps.push(step.name.clone());
        steps.push(step);
    }

    let mut report_command = vec![
        RELAY_BIN.to_string(),
        "collect".into(),
        "--store".into(),
        share.clone(),
        "--pattern".into(),
        config.fragment_pattern.clone(),
    ];
    match config.exchange {
        ExchangeKind::PathPartition => {
            report_command.extend(["--run-segment".to_string(), config.run_segment.clone()]);
        }
        ExchangeKind::ExplicitTick => {
            report_command.extend(["--expected".to_string(), config.variants.len().to_string()]);
        }
    }
    if config.report.skip_covered {
        report_command.push("--skip-covered".into());
    }
    if config.report.show_missing {
        report_command.push("--show-missing".into());
    }
    if let Some(root) = &config.report.source_root {
        report_command.extend(["--source-root".to_string(), root.to_string_lossy().to_string()]);
    }
    if let Some(fail_under) = config.report.fail_under {
        report_command.extend(["--fail-under".to_string(), fail_under.to_string()]);
    }
    let mut report_step = PlanStep::new(REPORT_STEP.to_string(), None, base_image, report_command);
    report_step.after = test_steps;
    steps.push(report_step);

    Ok(PipelinePlan {
        config_version: config.version,
        generated_at: Utc::now(),
        share,
        exchange: config.exchange,
        steps,
    })
}

pub fn write_plan(plan: &PipelinePlan, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create plan directory: {}", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create plan file: {}", path.display()))?;
    serde_yaml::to_writer(file, plan)
        .with_context(|| format!("Failed to write plan: {}", path.display()))?;
    Ok(())
}

fn identity_args(config: &PipelineConfig, tick: usize) -> [String; 2] {
    match config.exchange {
        ExchangeKind::PathPartition => ["--run-segment".into(), config.run_segment.clone()],
        ExchangeKind::ExplicitTick => ["--tick".into(), tick.to_string()],
    }
}

fn hash_command(name: &str, command: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for arg in command {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
