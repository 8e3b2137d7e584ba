//! Violation and exploration reports.

use std::fmt;
use std::fs;
use std::path::Path;

use log::info;
use serde::Serialize;
use snafu::Snafu;
use stepwise_protocol::ExitStatus;

use crate::config::Reduction;
use crate::record::RecordTrace;

/// Errors saving a report.
#[derive(Debug, Snafu)]
pub enum ReportError {
    #[snafu(display("I/O error"), context(false))]
    Io { source: std::io::Error },

    #[snafu(display("JSON error"), context(false))]
    Json { source: serde_json::Error },
}

/// What went wrong in the checked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Safety,
    Liveness,
    Deadlock,
    NonTermination,
    NonDeterminism,
    ProgramCrash,
}

impl ViolationKind {
    pub fn exit_status(self) -> ExitStatus {
        match self {
            Self::Safety => ExitStatus::Safety,
            Self::Liveness => ExitStatus::Liveness,
            Self::Deadlock => ExitStatus::Deadlock,
            Self::NonTermination => ExitStatus::NonTermination,
            Self::NonDeterminism => ExitStatus::NonDeterminism,
            Self::ProgramCrash => ExitStatus::ProgramCrash,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Safety => "safety violation",
            Self::Liveness => "liveness violation",
            Self::Deadlock => "deadlock",
            Self::NonTermination => "non-progressive cycle",
            Self::NonDeterminism => "non-deterministic communications",
            Self::ProgramCrash => "program crash",
        })
    }
}

/// A property violation with everything needed to reproduce it.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationReport {
    pub kind: ViolationKind,
    /// `*** PROPERTY NOT VALID ***` and friends.
    pub headline: String,
    /// Lines printed before the headline (locked requests, differences).
    pub details: Vec<String>,
    /// Counter-example, one rendered transition per line.
    pub trace: Vec<String>,
    #[serde(serialize_with = "serialize_path")]
    pub record_path: RecordTrace,
    /// Function names of each actor stack, for crashes.
    pub stacks: Vec<Vec<String>>,
}

fn serialize_path<S: serde::Serializer>(path: &RecordTrace, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(path)
}

impl ViolationReport {
    pub fn new(kind: ViolationKind, headline: impl Into<String>) -> Self {
        Self {
            kind,
            headline: headline.into(),
            details: Vec::new(),
            trace: Vec::new(),
            record_path: RecordTrace::default(),
            stacks: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_record_path(mut self, path: RecordTrace) -> Self {
        self.record_path = path;
        self
    }

    pub fn with_stacks(mut self, stacks: Vec<Vec<String>>) -> Self {
        self.stacks = stacks;
        self
    }

    /// The report as the checker logs it.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push("**************************".to_owned());
        lines.extend(self.details.iter().cloned());
        lines.push(self.headline.clone());
        lines.push("**************************".to_owned());
        lines.push("Counter-example execution trace:".to_owned());
        lines.extend(self.trace.iter().map(|t| format!("  {t}")));
        lines.push(format!("Path = {}", self.record_path));
        for (i, stack) in self.stacks.iter().enumerate() {
            lines.push(format!("Stack of actor context {i}:"));
            lines.extend(stack.iter().map(|f| format!("  {f}")));
        }
        lines
    }

    pub fn log(&self) {
        for line in self.lines() {
            info!("{line}");
        }
    }
}

/// Counters of one exploration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExplorationStats {
    pub expanded_states: u64,
    pub visited_states: u64,
    /// Liveness explores pairs instead of states.
    pub expanded_pairs: Option<u64>,
    pub visited_pairs: Option<u64>,
    pub executed_transitions: u64,
    pub send_deterministic: Option<bool>,
    pub recv_deterministic: Option<bool>,
}

impl ExplorationStats {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match (self.expanded_pairs, self.visited_pairs) {
            (Some(expanded), Some(visited)) => {
                lines.push(format!("Expanded pairs = {expanded}"));
                lines.push(format!("Visited pairs = {visited}"));
            }
            _ => {
                lines.push(format!("Expanded states = {}", self.expanded_states));
                lines.push(format!("Visited states = {}", self.visited_states));
            }
        }
        lines.push(format!("Executed transitions = {}", self.executed_transitions));
        if let Some(send) = self.send_deterministic {
            lines.push(format!("Send-deterministic : {}", yes_no(send)));
        }
        if let Some(recv) = self.recv_deterministic {
            lines.push(format!("Recv-deterministic : {}", yes_no(recv)));
        }
        lines
    }

    pub fn log(&self) {
        for line in self.lines() {
            info!("{line}");
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

/// Outcome of a whole exploration.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationReport {
    /// Which checker ran.
    pub checker: String,
    pub reduction: Reduction,
    pub stats: ExplorationStats,
    pub violation: Option<ViolationReport>,
}

impl ExplorationReport {
    pub fn exit_status(&self) -> ExitStatus {
        self.violation
            .as_ref()
            .map_or(ExitStatus::Success, |v| v.kind.exit_status())
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Format an exploration report for human consumption.
pub fn format_report(report: &ExplorationReport) -> String {
    let mut output = String::new();

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output.push_str("  stepwise Exploration Report\n");
    output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

    output.push_str(&format!("Checker:                {}\n", report.checker));
    output.push_str(&format!("Reduction:              {}\n", report.reduction));
    output.push('\n');

    output.push_str("─── Statistics ────────────────────────────────────────────────────────\n");
    for line in report.stats.lines() {
        output.push_str(&line);
        output.push('\n');
    }
    output.push('\n');

    match &report.violation {
        Some(violation) => {
            output.push_str(
                "─── Violation Found ───────────────────────────────────────────────────\n",
            );
            output.push_str(&format!("Kind:                   {}\n", violation.kind));
            output.push_str(&format!(
                "Exit status:            {}\n\n",
                violation.kind.exit_status().code()
            ));
            for line in violation.lines() {
                output.push_str(&line);
                output.push('\n');
            }
            output.push('\n');
        }
        None => {
            output.push_str(
                "─── No Violation Found ────────────────────────────────────────────────\n",
            );
            output.push_str("No property violation found.\n\n");
        }
    }

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");

    output
}
