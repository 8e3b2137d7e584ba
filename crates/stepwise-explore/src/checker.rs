//! The checker seam and the top-level exploration entry point.

use log::info;
use stepwise_mc::{Crash, McError};
use stepwise_protocol::ExitStatus;
use thiserror::Error;

use crate::automaton::AutomatonError;
use crate::comm_determinism::CommDeterminismChecker;
use crate::config::{CheckerConfig, CheckerMode};
use crate::dot::DotError;
use crate::liveness::LivenessChecker;
use crate::record::{RecordError, RecordTrace};
use crate::request::{request_to_string, ActorNames};
use crate::report::{
    ExplorationReport, ExplorationStats, ReportError, ViolationKind, ViolationReport,
};
use crate::safety::SafetyChecker;
use crate::session::Session;

/// Errors from the exploration engine.
#[derive(Error, Debug)]
pub enum ExploreError {
    #[error(transparent)]
    Mc(#[from] McError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The explored program violates its property.
    #[error("{}", .0.kind)]
    Violation(Box<ViolationReport>),

    #[error("dot output: {0}")]
    Dot(#[from] DotError),

    #[error("property automaton: {0}")]
    Automaton(#[from] AutomatonError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("replay failed: {0}")]
    Replay(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("report: {0}")]
    Report(#[from] ReportError),
}

impl ExploreError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Violation(report) => report.kind.exit_status(),
            Self::Mc(McError::AssertionFailed) => ExitStatus::Safety,
            Self::Mc(McError::ProcessCrashed(_)) => ExitStatus::ProgramCrash,
            _ => ExitStatus::Error,
        }
    }
}

/// An exploration strategy over a [`Session`].
pub trait Checker {
    /// Explore until the state space is exhausted or a violation is found,
    /// which comes back as [`ExploreError::Violation`].
    fn run(&mut self) -> Result<(), ExploreError>;

    fn stats(&self) -> ExplorationStats;

    fn name(&self) -> &'static str;
}

/// Run the checker `config` asks for against `session`.
///
/// Violations end up in the returned report; only failures of the
/// exploration itself are errors.
pub fn explore<S: Session>(
    session: &mut S,
    config: &CheckerConfig,
) -> Result<ExplorationReport, ExploreError> {
    let config = config.clone().validate()?;
    let mut checker: Box<dyn Checker + '_> = match config.mode() {
        CheckerMode::Safety => Box::new(SafetyChecker::new(session, &config)?),
        CheckerMode::CommDeterminism => Box::new(CommDeterminismChecker::new(session, &config)?),
        CheckerMode::Liveness => Box::new(LivenessChecker::new(session, &config)?),
    };

    let violation = match checker.run() {
        Ok(()) => None,
        Err(ExploreError::Violation(report)) => Some(*report),
        Err(e) => return Err(e),
    };
    let report = ExplorationReport {
        checker: checker.name().to_owned(),
        reduction: config.reduction(),
        stats: checker.stats(),
        violation,
    };
    Ok(report)
}

/// Turn an error from executing a transition into a violation when the
/// checked program is at fault.
pub(crate) fn classify(err: McError, trace: Vec<String>, path: RecordTrace) -> ExploreError {
    match err {
        McError::AssertionFailed => {
            let report = ViolationReport::new(ViolationKind::Safety, "*** PROPERTY NOT VALID ***")
                .with_trace(trace)
                .with_record_path(path);
            report.log();
            ExploreError::Violation(Box::new(report))
        }
        McError::ProcessCrashed(crash) => {
            let report = crash_report(crash).with_trace(trace).with_record_path(path);
            report.log();
            ExploreError::Violation(Box::new(report))
        }
        other => other.into(),
    }
}

/// Report the deadlock the session is in: one locked request per actor
/// still waiting on a simcall.
pub(crate) fn deadlock_report<S: Session>(
    session: &mut S,
    names: &mut ActorNames,
    trace: Vec<String>,
    path: RecordTrace,
) -> Result<ExploreError, McError> {
    let actors = session.actors()?;
    names.learn(&actors);
    let mut details = vec!["Locked request:".to_owned()];
    for actor in actors.iter().filter(|a| !a.simcall.is_none()) {
        details.push(format!("  {}", request_to_string(&actor.simcall, 0, names)));
    }
    let report = ViolationReport::new(ViolationKind::Deadlock, "**** DEADLOCK DETECTED ****")
        .with_details(details)
        .with_trace(trace)
        .with_record_path(path);
    report.log();
    Ok(ExploreError::Violation(Box::new(report)))
}

fn crash_report(crash: Crash) -> ViolationReport {
    let mut details = Vec::new();
    match (crash.signal, crash.exit_code) {
        (Some(signal), _) => details.push(format!("From signal: {}", signal.as_str())),
        (None, Some(code)) => details.push(format!("From exit: {code}")),
        (None, None) => {}
    }
    details.push(if crash.core_dumped {
        "A core dump was generated by the system.".to_owned()
    } else {
        "No core dump was generated by the system.".to_owned()
    });
    info!("checked program crashed, collecting {} stacks", crash.stacks.len());
    ViolationReport::new(ViolationKind::ProgramCrash, "** CRASH IN THE PROGRAM **")
        .with_details(details)
        .with_stacks(crash.stacks)
}
