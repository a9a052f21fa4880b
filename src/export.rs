//! Export a harvest report as JSON, and print its summary table.
//!
//! The JSON document is the full [`HarvestReport`]: session id, items,
//! strategy used, status and per-entry statistics, so downstream
//! consumers can detect a short or degraded harvest.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::models::{EntryOutcome, HarvestReport};
use crate::progress::format_number;

/// Write the report as pretty JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub fn write_report(report: &HarvestReport, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            eprintln!(
                "Exported {} items to {}",
                format_number(report.item_count() as u64),
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(json.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }

    Ok(())
}

/// Per-entry summary table, written to stderr.
pub fn print_summary(report: &HarvestReport) {
    eprintln!(
        "{:<24} {:>9} {:>6} {:>7} {:>9} {:>5} {:>9}  OUTCOME",
        "ENTRY", "ITEMS", "DUPES", "PROBES", "DEGRADED", "LOST", "MALFORMED"
    );
    for entry in &report.entries {
        let outcome = match &entry.outcome {
            EntryOutcome::Pending => "pending".to_string(),
            EntryOutcome::Harvested => match entry.strategy {
                Some(strategy) => format!("ok ({})", strategy),
                None => "ok".to_string(),
            },
            EntryOutcome::Failed(reason) => format!("failed: {}", reason),
        };
        eprintln!(
            "{:<24} {:>9} {:>6} {:>7} {:>9} {:>5} {:>9}  {}",
            entry.name,
            format_number(entry.items),
            entry.duplicates,
            entry.partitions_probed,
            entry.degraded_partitions,
            entry.lost_pages,
            entry.malformed,
            outcome
        );
    }
    eprintln!();
    eprintln!(
        "session {}  {} items  strategy={}  status={:?}  recovery_attempted={}",
        report.session_id,
        format_number(report.item_count() as u64),
        report
            .strategy_used
            .map(|s| s.as_str())
            .unwrap_or("none"),
        report.status,
        report.recovery_attempted
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryStats, HarvestStatus, Strategy};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_write_report_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out").join("report.json");
        let report = HarvestReport {
            session_id: "s-1".to_string(),
            items: Vec::new(),
            strategy_used: Some(Strategy::Fallback),
            status: HarvestStatus::Partial,
            recovery_attempted: true,
            entries: vec![EntryStats::new("ACME")],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        write_report(&report, Some(&path)).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["strategy_used"], "fallback");
        assert_eq!(json["status"], "partial");
        assert_eq!(json["recovery_attempted"], true);
        assert_eq!(json["entries"][0]["name"], "ACME");
        assert_eq!(json["entries"][0]["outcome"]["kind"], "pending");
    }
}
