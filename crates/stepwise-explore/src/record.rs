//! Record paths: a violating trace as a string that can be replayed.

use std::fmt;
use std::str::FromStr;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use stepwise_mc::McError;
use thiserror::Error;

use crate::checker::ExploreError;
use crate::report::{ViolationKind, ViolationReport};
use crate::request::{request_to_string, ActorNames};
use crate::session::{Session, Transition};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid transition '{0}' in record path")]
    InvalidTransition(String),
}

/// Transitions from the initial state, written `1;2/1;3`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTrace(pub Vec<Transition>);

impl RecordTrace {
    pub fn new(transitions: Vec<Transition>) -> Self {
        Self(transitions)
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, transition) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{transition}")?;
        }
        Ok(())
    }
}

impl FromStr for RecordTrace {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split(';')
            .map(|item| -> Result<Transition, RecordError> {
                let invalid = || RecordError::InvalidTransition(item.to_owned());
                let (pid, argument) = match item.split_once('/') {
                    Some((pid, argument)) => (pid, argument.parse().map_err(|_| invalid())?),
                    None => (item, 0),
                };
                let pid = pid.parse().map_err(|_| invalid())?;
                Ok(Transition::new(pid, argument))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Execute `trace` from the initial state.
///
/// Returns the number of transitions executed; a failing assertion along
/// the way surfaces as a safety violation.
pub fn replay<S: Session>(session: &mut S, trace: &RecordTrace) -> Result<usize, ExploreError> {
    info!("path={trace}");
    session.initialize()?;
    let mut names = ActorNames::new();

    for (done, transition) in trace.transitions().iter().enumerate() {
        let actors = session.actors()?;
        names.learn(&actors);
        let actor = actors
            .iter()
            .find(|a| a.pid == transition.pid)
            .ok_or_else(|| ExploreError::Replay(format!("unexpected actor (pid: {})", transition.pid)))?;
        if actor.simcall.is_none() {
            return Err(ExploreError::Replay(format!(
                "actor {} has no pending simcall at step {}",
                transition.pid,
                done + 1
            )));
        }
        if !session.actor_is_enabled(transition.pid)? {
            return Err(ExploreError::Replay(format!(
                "actor {} cannot run at step {}",
                transition.pid,
                done + 1
            )));
        }
        debug!(
            "Replay: {}",
            request_to_string(&actor.simcall, transition.argument, &names)
        );

        match session.execute(*transition) {
            Ok(()) => {}
            Err(McError::AssertionFailed) => {
                let report = ViolationReport::new(ViolationKind::Safety, "*** PROPERTY NOT VALID ***")
                    .with_record_path(RecordTrace::new(trace.0[..=done].to_vec()));
                return Err(ExploreError::Violation(Box::new(report)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!("Replayed {} transitions", trace.len());
    Ok(trace.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_paths() {
        let trace: RecordTrace = "1;2/1;3".parse().unwrap();
        assert_eq!(
            trace.transitions(),
            [Transition::new(1, 0), Transition::new(2, 1), Transition::new(3, 0)]
        );
        assert_eq!(trace.to_string(), "1;2/1;3");
    }

    #[test]
    fn empty_path_is_empty_trace() {
        let trace: RecordTrace = "".parse().unwrap();
        assert!(trace.is_empty());
        assert_eq!(trace.to_string(), "");
    }

    #[test]
    fn negative_arguments_survive() {
        let trace: RecordTrace = "2/-1".parse().unwrap();
        assert_eq!(trace.transitions(), [Transition::new(2, -1)]);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            "1;x".parse::<RecordTrace>(),
            Err(RecordError::InvalidTransition("x".into()))
        );
        assert!("1/".parse::<RecordTrace>().is_err());
        assert!("-1".parse::<RecordTrace>().is_err());
    }
}
