use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::error::FileReportIssue;
use crate::fragment::{CoverageData, FileCoverage};

const TOTAL_LABEL: &str = "TOTAL";

#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub skip_covered: bool,
    pub show_missing: bool,
    /// When set, every reported file must be readable below this directory.
    pub source_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub file: String,
    pub statements: usize,
    pub missed: usize,
    pub missing: String,
}

impl ReportRow {
    fn from_coverage(file: &str, coverage: &FileCoverage) -> Self {
        let missing = coverage.missing();
        Self {
            file: file.to_string(),
            statements: coverage.statements.len(),
            missed: missing.len(),
            missing: format_line_ranges(&coverage.statements, &missing),
        }
    }

    pub fn percent(&self) -> f64 {
        percent(self.statements, self.missed)
    }

    pub fn is_complete(&self) -> bool {
        self.missed == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub rows: Vec<ReportRow>,
    pub total_statements: usize,
    pub total_missed: usize,
    pub skipped_covered: usize,
    #[serde(skip)]
    pub issues: Vec<FileReportIssue>,
    #[serde(skip)]
    show_missing: bool,
}

impl CoverageReport {
    pub fn build(database: &CoverageData, options: &ReportOptions) -> Self {
        let mut rows = Vec::new();
        let mut issues = Vec::new();
        let mut total_statements = 0;
        let mut total_missed = 0;
        let mut skipped_covered = 0;

        for (file, coverage) in &database.files {
            if let Some(root) = &options.source_root {
                let source = root.join(file);
                if let Err(err) = fs::File::open(&source) {
                    warn!(file = %file, source = %source.display(), error = %err, "Skipping file with unreadable source");
                    issues.push(FileReportIssue::new(
                        file.clone(),
                        format!("no source for code: {err}"),
                    ));
                    continue;
                }
            }

            let row = ReportRow::from_coverage(file, coverage);
            total_statements += row.statements;
            total_missed += row.missed;
            if options.skip_covered && row.is_complete() {
                skipped_covered += 1;
                continue;
            }
            rows.push(row);
        }

        Self {
            rows,
            total_statements,
            total_missed,
            skipped_covered,
            issues,
            show_missing: options.show_missing,
        }
    }

    pub fn total_percent(&self) -> f64 {
        percent(self.total_statements, self.total_missed)
    }

    pub fn render(&self) -> String {
        let name_width = self
            .rows
            .iter()
            .map(|row| row.file.len())
            .chain(["Name".len(), TOTAL_LABEL.len()])
            .max()
            .unwrap_or(TOTAL_LABEL.len());

        let mut header = format!(
            "{:<name_width$}  {:>6} {:>6} {:>6}",
            "Name", "Stmts", "Miss", "Cover"
        );
        if self.show_missing {
            header.push_str("   Missing");
        }
        let rule = "-".repeat(header.len());

        let mut out = String::new();
        let _ = writeln!(out, "{header}");
        let _ = writeln!(out, "{rule}");
        for row in &self.rows {
            let _ = writeln!(
                out,
                "{}",
                self.format_row(&row.file, row.statements, row.missed, &row.missing, name_width)
            );
        }
        if !self.rows.is_empty() {
            let _ = writeln!(out, "{rule}");
        }
        let _ = writeln!(
            out,
            "{}",
            self.format_row(
                TOTAL_LABEL,
                self.total_statements,
                self.total_missed,
                "",
                name_width
            )
        );
        if self.skipped_covered > 0 {
            let noun = if self.skipped_covered == 1 { "file" } else { "files" };
            let _ = writeln!(
                out,
                "\n{} {noun} skipped due to complete coverage.",
                self.skipped_covered
            );
        }
        out
    }

    pub fn write_to<W: Write>(&self, mut sink: W) -> io::Result<()> {
        sink.write_all(self.render().as_bytes())?;
        sink.flush()
    }

    fn format_row(
        &self,
        name: &str,
        statements: usize,
        missed: usize,
        missing: &str,
        name_width: usize,
    ) -> String {
        let mut line = format!(
            "{:<name_width$}  {:>6} {:>6} {:>6}",
            name,
            statements,
            missed,
            display_percent(statements, missed)
        );
        if self.show_missing && !missing.is_empty() {
            line.push_str("   ");
            line.push_str(missing);
        }
        line.trim_end().to_string()
    }
}

fn percent(statements: usize, missed: usize) -> f64 {
    if statements == 0 {
        100.0
    } else {
        (statements - missed) as f64 * 100.0 / statements as f64
    }
}

/// Whole-number percentage that never rounds partial coverage to 0% or 100%.
pub fn display_percent(statements: usize, missed: usize) -> String {
    let pc = percent(statements, missed);
    let shown = if pc > 0.0 && pc < 1.0 {
        1.0
    } else if pc > 99.0 && pc < 100.0 {
        99.0
    } else {
        pc.round_ties_even()
    };
    format!("{shown:.0}%")
}

/// Compress missed lines into ranges such as `3-5, 9`.
///
/// A range spans consecutive statements, so non-statement lines between two
/// missed statements do not split it.
pub fn format_line_ranges(statements: &BTreeSet<u32>, missing: &BTreeSet<u32>) -> String {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    let mut open: Option<(u32, u32)> = None;

    for &line in statements {
        if missing.contains(&line) {
            open = Some(match open {
                Some((start, _)) => (start, line),
                None => (line, line),
            });
        } else if let Some(range) = open.take() {
            ranges.push(range);
        }
    }
    ranges.extend(open);

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[u32]) -> BTreeSet<u32> {
        items.iter().copied().collect()
    }

    #[test]
    fn ranges_follow_statement_order() {
        let statements = lines(&[1, 2, 3, 5, 6, 9, 10]);
        let missing = lines(&[2, 3, 5, 10]);
        assert_eq!(format_line_ranges(&statements, &missing), "2-5, 10");
        assert_eq!(format_line_ranges(&statements, &BTreeSet::new()), "");
    }

    #[test]
    fn percent_never_rounds_to_extremes() {
        assert_eq!(display_percent(1000, 1), "99%");
        assert_eq!(display_percent(1000, 999), "1%");
        assert_eq!(display_percent(10, 0), "100%");
        assert_eq!(display_percent(10, 10), "0%");
        assert_eq!(display_percent(0, 0), "100%");
        assert_eq!(display_percent(8, 2), "75%");
        // Halves round to even, as coverage.py displays them.
        assert_eq!(display_percent(8, 7), "12%");
        assert_eq!(display_percent(8, 1), "88%");
    }

    #[test]
    fn skip_covered_keeps_files_in_total() {
        let mut db = CoverageData::new();
        db.record("full.py", FileCoverage::new([1, 2], [1, 2]));
        db.record("partial.py", FileCoverage::new([1, 2, 3, 4], [1]));

        let options = ReportOptions {
            skip_covered: true,
            show_missing: true,
            source_root: None,
        };
        let report = CoverageReport::build(&db, &options);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.skipped_covered, 1);
        assert_eq!(report.total_statements, 6);
        assert_eq!(report.total_missed, 3);

        let text = report.render();
        assert!(text.contains("partial.py"));
        assert!(!text.contains("full.py"));
        assert!(text.contains("2-4"));
        assert!(text.contains("1 file skipped due to complete coverage."));

        let row = text
            .lines()
            .find(|line| line.starts_with("partial.py"))
            .unwrap();
        let fields: Vec<_> = row.split_whitespace().collect();
        assert_eq!(fields, vec!["partial.py", "4", "3", "25%", "2-4"]);
        let total = text.lines().find(|line| line.starts_with("TOTAL")).unwrap();
        assert_eq!(
            total.split_whitespace().collect::<Vec<_>>(),
            vec!["TOTAL", "6", "3", "50%"]
        );
    }

    #[test]
    fn unreadable_sources_are_skipped_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("present.py"), "x = 1\n").unwrap();

        let mut db = CoverageData::new();
        db.record("present.py", FileCoverage::new([1], [1]));
        db.record("vanished.py", FileCoverage::new([1, 2], []));

        let options = ReportOptions {
            source_root: Some(temp.path().to_path_buf()),
            ..ReportOptions::default()
        };
        let report = CoverageReport::build(&db, &options);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].subject, "vanished.py");
        assert_eq!(report.total_statements, 1);
    }
}
