use std::collections::HashSet;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::strategy::{ExchangeKind, segment_key, tick_file_name};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", config.version));
    }

    if config.share.as_os_str().is_empty() {
        report
            .errors
            .push("Shared store path cannot be empty".into());
    } else if config.share.is_relative() {
        report.warnings.push(format!(
            "Shared store path '{}' is relative; containers may resolve it differently",
            config.share.display()
        ));
    }

    if let Err(err) = segment_key(&config.run_segment) {
        report
            .errors
            .push(format!("Run segment '{}' is invalid: {err}", config.run_segment));
    }

    report.merge(validate_pattern(config));

    if config.variants.is_empty() {
        report
            .errors
            .push("At least one test variant is required".into());
    }

    let mut seen = HashSet::new();
    for (idx, variant) in config.variants.iter().enumerate() {
        let label = format!("Variant {} ('{}')", idx + 1, variant.name);
        if variant.name.trim().is_empty() {
            report
                .errors
                .push(format!("Variant {} has an empty name", idx + 1));
        } else if !seen.insert(variant.name.as_str()) {
            report
                .errors
                .push(format!("{label} duplicates an earlier variant name"));
        }
        if variant.image.trim().is_empty() {
            report.errors.push(format!("{label} has no image"));
        }
        if variant.test_command.is_empty() {
            report.errors.push(format!("{label} has an empty test command"));
        }
    }

    match &config.style {
        Some(style) if style.command.is_empty() => {
            report
                .errors
                .push("Style step command cannot be empty".into());
        }
        Some(_) => {}
        None => report
            .warnings
            .push("No style step configured".into()),
    }

    if let Some(fail_under) = config.report.fail_under
        && !(0.0..=100.0).contains(&fail_under)
    {
        report.errors.push(format!(
            "fail_under must be between 0 and 100, got {fail_under}"
        ));
    }

    report
}

fn validate_pattern(config: &PipelineConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    match glob::Pattern::new(&config.fragment_pattern) {
        Err(err) => report.errors.push(format!(
            "Fragment pattern '{}' is not a valid glob: {}",
            config.fragment_pattern, err
        )),
        Ok(pattern) => {
            // Tick fragments come back as `.coverage.<N>` and must still be combined.
            if config.exchange == ExchangeKind::ExplicitTick && !pattern.matches(&tick_file_name(0)) {
                report.errors.push(format!(
                    "Fragment pattern '{}' does not match retrieved tick fragments such as '{}'",
                    config.fragment_pattern,
                    tick_file_name(0)
                ));
            }
        }
    }
    report
}
