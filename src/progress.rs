//! Progress reporting for bulk sweeps.
//!
//! `corpus reprocess` reports one event per finished document so users can
//! see how far a long sweep has come. Progress goes to **stderr** so stdout
//! stays parseable for scripts.

use std::io::{IsTerminal, Write};

use corpus_harness_core::models::{BatchSummary, ProcessingResult};

/// A single progress event for a sweep.
#[derive(Clone, Debug)]
pub enum ProgressEvent<'a> {
    /// Candidates have been enumerated.
    Started { total: usize },
    /// One document finished (successfully or not).
    Document {
        done: usize,
        total: usize,
        result: &'a ProcessingResult,
    },
    Finished { summary: &'a BatchSummary },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent<'_>);
}

/// Human-friendly progress on stderr: "reprocess  12 / 340  ok  decks/q3.pptx".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        let line = match event {
            ProgressEvent::Started { total } => {
                format!("reprocess  {} documents\n", format_number(total as u64))
            }
            ProgressEvent::Document {
                done,
                total,
                result,
            } => {
                let outcome = match &result.error {
                    None => "ok".to_string(),
                    Some(err) => format!("failed ({})", err.kind),
                };
                format!(
                    "reprocess  {} / {}  {}  {}\n",
                    format_number(done as u64),
                    format_number(total as u64),
                    outcome,
                    result.filename
                )
            }
            ProgressEvent::Finished { summary } => {
                let mut line = format!(
                    "reprocess  done  {} / {} succeeded",
                    format_number(summary.success as u64),
                    format_number(summary.total as u64)
                );
                if summary.cancelled {
                    line.push_str(&format!(
                        "  (cancelled, {} skipped)",
                        format_number(summary.skipped as u64)
                    ));
                }
                line.push('\n');
                line
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        let obj = match event {
            ProgressEvent::Started { total } => serde_json::json!({
                "event": "started",
                "total": total,
            }),
            ProgressEvent::Document {
                done,
                total,
                result,
            } => serde_json::json!({
                "event": "document",
                "n": done,
                "total": total,
                "filename": result.filename,
                "status": result.status,
                "error": result.error,
            }),
            ProgressEvent::Finished { summary } => serde_json::json!({
                "event": "finished",
                "success": summary.success,
                "total": summary.total,
                "cancelled": summary.cancelled,
                "skipped": summary.skipped,
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

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent<'_>) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
