//! Harvest progress reporting.
//!
//! Reports what a `harvest run` is doing (which entry point, under which
//! strategy, how many items so far) so an operator can follow a long
//! unattended session. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts; it is separate from `tracing` logs.

use std::io::Write;

use crate::models::Strategy;

/// A single progress event for a harvest session.
#[derive(Clone, Debug, PartialEq)]
pub enum HarvestProgressEvent {
    /// An entry point is about to be harvested.
    EntryStarted {
        strategy: Strategy,
        entry: String,
        /// 1-based position among the entry points.
        n: usize,
        total: usize,
    },
    /// An entry point finished (successfully or not).
    EntryFinished {
        strategy: Strategy,
        entry: String,
        /// New items this entry contributed so far.
        items: u64,
        /// Items accumulated in the whole session.
        session_items: u64,
        failed: bool,
    },
    /// The credential was rejected and recovery is running.
    Recovering { reason: String },
    /// The session switched to the fallback strategy.
    FallingBack { reason: String },
}

/// Reports harvest progress. Implementations write to stderr (human or JSON).
pub trait HarvestProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress on stderr: "primary [3/7] ACME  1,234 items (session 5,678)".
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = match &event {
            HarvestProgressEvent::EntryStarted {
                strategy,
                entry,
                n,
                total,
            } => format!("{} [{}/{}] {}  harvesting...\n", strategy, n, total, entry),
            HarvestProgressEvent::EntryFinished {
                strategy,
                entry,
                items,
                session_items,
                failed,
            } => {
                let status = if *failed { "  FAILED" } else { "" };
                format!(
                    "{} {}  {} items (session {}){}\n",
                    strategy,
                    entry,
                    format_number(*items),
                    format_number(*session_items),
                    status
                )
            }
            HarvestProgressEvent::Recovering { reason } => {
                format!("credential rejected ({}), recovering...\n", reason)
            }
            HarvestProgressEvent::FallingBack { reason } => {
                format!("switching to fallback: {}\n", reason)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let obj = match &event {
            HarvestProgressEvent::EntryStarted {
                strategy,
                entry,
                n,
                total,
            } => serde_json::json!({
                "event": "entry_started",
                "strategy": strategy,
                "entry": entry,
                "n": n,
                "total": total
            }),
            HarvestProgressEvent::EntryFinished {
                strategy,
                entry,
                items,
                session_items,
                failed,
            } => serde_json::json!({
                "event": "entry_finished",
                "strategy": strategy,
                "entry": entry,
                "items": items,
                "session_items": session_items,
                "failed": failed
            }),
            HarvestProgressEvent::Recovering { reason } => serde_json::json!({
                "event": "recovering",
                "reason": reason
            }),
            HarvestProgressEvent::FallingBack { reason } => serde_json::json!({
                "event": "fallback",
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}' (expected human, json or off)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_mode_parse() {
        assert_eq!("json".parse::<ProgressMode>(), Ok(ProgressMode::Json));
        assert_eq!("off".parse::<ProgressMode>(), Ok(ProgressMode::Off));
        assert!("verbose".parse::<ProgressMode>().is_err());
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
