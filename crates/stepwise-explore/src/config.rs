//! Exploration flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::warn;
use serde::Serialize;

use crate::checker::ExploreError;

/// Partial-order reduction applied by the safety checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Interleave every enabled actor at every state.
    None,
    /// Interleave one actor, and add others when backtracking finds a
    /// dependency.
    Dpor,
}

impl FromStr for Reduction {
    type Err = ExploreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "dpor" => Ok(Self::Dpor),
            other => Err(ExploreError::Config(format!(
                "unknown reduction '{other}' (expected 'none' or 'dpor')"
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Dpor => "dpor",
        })
    }
}

/// Which checker an exploration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerMode {
    Safety,
    Liveness,
    CommDeterminism,
}

/// Configuration for one exploration session.
#[derive(Debug, Clone, Serialize)]
pub struct CheckerConfig {
    /// Reduction mode; unset means DPOR unless something forces `none`.
    pub reduction: Option<Reduction>,
    /// Deepest exploration stack before backtracking.
    pub max_depth: usize,
    /// Visited states kept for state-equality reduction (0 = stateless).
    pub max_visited_states: usize,
    /// Detect non-progressive cycles.
    pub termination: bool,
    /// Compare snapshot hashes before comparing contents.
    pub hash: bool,
    /// Store large regions page by page.
    pub sparse_checkpoint: bool,
    /// Snapshot every N states (0 = only when needed).
    pub checkpoint: u64,
    /// Record open files in snapshots.
    pub snapshot_fds: bool,
    /// Write the explored graph here.
    pub dot_output: Option<PathBuf>,
    /// Never-claim of the LTL property; selects liveness checking.
    pub property_file: Option<PathBuf>,
    pub comms_determinism: bool,
    pub send_determinism: bool,
    /// Visited pairs kept by the liveness checker (0 = none).
    pub visited_pairs: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            reduction: None,
            max_depth: 1000,
            max_visited_states: 0,
            termination: false,
            hash: false,
            sparse_checkpoint: false,
            checkpoint: 0,
            snapshot_fds: false,
            dot_output: None,
            property_file: None,
            comms_determinism: false,
            send_determinism: false,
            visited_pairs: 0,
        }
    }
}

impl CheckerConfig {
    pub fn mode(&self) -> CheckerMode {
        if self.property_file.is_some() {
            CheckerMode::Liveness
        } else if self.comms_determinism || self.send_determinism {
            CheckerMode::CommDeterminism
        } else {
            CheckerMode::Safety
        }
    }

    /// Settle the reduction mode and reject flag combinations no checker
    /// supports.
    pub fn validate(mut self) -> Result<Self, ExploreError> {
        if self.max_depth == 0 {
            return Err(ExploreError::Config("max depth must be at least 1".into()));
        }

        match self.mode() {
            CheckerMode::Liveness => {
                if self.comms_determinism || self.send_determinism {
                    return Err(ExploreError::Config(
                        "liveness and communication determinism cannot be checked together".into(),
                    ));
                }
                if self.reduction == Some(Reduction::Dpor) {
                    return Err(ExploreError::Config(
                        "DPOR reduction is not supported for liveness properties".into(),
                    ));
                }
                self.reduction = Some(Reduction::None);
            }
            CheckerMode::CommDeterminism => {
                self.reduction = Some(Reduction::None);
            }
            CheckerMode::Safety => {}
        }

        if self.termination {
            if self.reduction == Some(Reduction::Dpor) {
                warn!("Non-termination detection is not compatible with DPOR, disabling reduction");
            }
            self.reduction = Some(Reduction::None);
        }
        if self.reduction.is_none() {
            self.reduction = Some(Reduction::Dpor);
        }
        Ok(self)
    }

    /// The reduction in effect; DPOR until [`validate`](Self::validate)
    /// decides otherwise.
    pub fn reduction(&self) -> Reduction {
        self.reduction.unwrap_or(Reduction::Dpor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn defaults_to_stateless_dpor_safety() {
        let config = CheckerConfig::default().validate().unwrap();
        assert_eq!(config.mode(), CheckerMode::Safety);
        assert_eq!(config.reduction, Some(Reduction::Dpor));
        assert_eq!(config.max_depth, 1000);
        assert_eq!(config.max_visited_states, 0);
    }

    #[test]
    fn termination_forces_no_reduction() {
        let config = CheckerConfig {
            termination: true,
            reduction: Some(Reduction::Dpor),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.reduction(), Reduction::None);
    }

    #[test]
    fn liveness_rejects_dpor_and_determinism() {
        let liveness = CheckerConfig {
            property_file: Some(PathBuf::from("never.ltl")),
            ..Default::default()
        };
        assert_eq!(liveness.mode(), CheckerMode::Liveness);
        assert_eq!(liveness.clone().validate().unwrap().reduction(), Reduction::None);

        let with_dpor = CheckerConfig {
            reduction: Some(Reduction::Dpor),
            ..liveness.clone()
        };
        assert!(matches!(with_dpor.validate(), Err(ExploreError::Config(_))));

        let with_determinism = CheckerConfig {
            send_determinism: true,
            ..liveness
        };
        assert!(matches!(with_determinism.validate(), Err(ExploreError::Config(_))));
    }

    #[test]
    fn reduction_parses_from_flags() {
        assert_eq!("none".parse::<Reduction>().unwrap(), Reduction::None);
        assert_eq!("dpor".parse::<Reduction>().unwrap(), Reduction::Dpor);
        assert!("sleep-set".parse::<Reduction>().is_err());
        assert_eq!(Reduction::Dpor.to_string(), "dpor");
    }

    #[test]
    fn config_serializes_for_reports() {
        let json = serde_json::to_value(CheckerConfig::default()).unwrap();
        assert_eq!(json["max_depth"], 1000);
        assert_eq!(json["reduction"], serde_json::Value::Null);
    }
}
