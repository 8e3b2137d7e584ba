//! Liveness checking of never-claims over the in-process actor system.

mod common;

use std::fs;
use std::path::Path;

use common::{Op, ToySession};
use stepwise_explore::config::{CheckerConfig, Reduction};
use stepwise_explore::{explore, AutomatonError, ExploreError, ViolationKind};
use stepwise_protocol::ExitStatus;

/// Never-claim of `<>cs`: accepts the runs where `cs` never holds.
const EVENTUALLY_CS: &str = "never { /* !(<>cs) */
accept_init:
\tif
\t:: (!cs) -> goto accept_init
\tfi;
}
";

fn property_config(dir: &Path) -> CheckerConfig {
    let path = dir.join("eventually_cs.never");
    fs::write(&path, EVENTUALLY_CS).unwrap();
    CheckerConfig {
        property_file: Some(path),
        ..CheckerConfig::default()
    }
}

/// Actor drawing the same value forever.
fn spinning() -> Vec<Vec<Op>> {
    vec![vec![Op::Random { min: 0, max: 0 }, Op::Goto(0)]]
}

#[test]
fn test_accepting_cycle_violates_property() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = ToySession::new(spinning()).with_propositions(&["cs"]);
    let report = explore(&mut session, &property_config(dir.path())).unwrap();

    assert_eq!(report.checker, "liveness");
    assert_eq!(report.reduction, Reduction::None);
    let violation = report.violation.as_ref().expect("cycle not found");
    assert_eq!(violation.kind, ViolationKind::Liveness);
    assert_eq!(violation.headline, "*** PROPERTY NOT VALID ***");
    assert_eq!(
        violation.details,
        vec![
            "Pair 3 already reached (equal to pair 2) !",
            "Counter-example depth: 3",
        ]
    );
    assert_eq!(violation.record_path.to_string(), "1;1");
    assert_eq!(report.exit_status(), ExitStatus::Liveness);
}

#[test]
fn test_property_holds_once_cs_is_reached() {
    let dir = tempfile::tempdir().unwrap();
    let programs = vec![vec![Op::Random { min: 0, max: 0 }, Op::Set("cs", true)]];
    let mut session = ToySession::new(programs).with_propositions(&["cs"]);
    let report = explore(&mut session, &property_config(dir.path())).unwrap();

    assert!(report.violation.is_none());
    assert_eq!(report.stats.expanded_pairs, Some(1));
    assert_eq!(report.stats.executed_transitions, 1);
    assert_eq!(report.exit_status(), ExitStatus::Success);
}

#[test]
fn test_max_depth_cuts_non_accepting_runs() {
    let dir = tempfile::tempdir().unwrap();
    // `cs` holds from the start, so no pair is ever accepting.
    let programs = vec![vec![
        Op::Set("cs", true),
        Op::Random { min: 0, max: 0 },
        Op::Goto(1),
    ]];
    let property = CheckerConfig {
        property_file: Some(dir.path().join("always.never")),
        max_depth: 10,
        ..CheckerConfig::default()
    };
    fs::write(
        dir.path().join("always.never"),
        "never {\nT0_init:\n\tif\n\t:: (1) -> goto T0_init\n\tfi;\n}\n",
    )
    .unwrap();
    let mut session = ToySession::new(programs).with_propositions(&["cs"]);
    let report = explore(&mut session, &property).unwrap();

    assert!(report.violation.is_none());
    assert_eq!(report.stats.executed_transitions, 10);
}

#[test]
fn test_unregistered_proposition_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = ToySession::new(spinning());
    let err = explore(&mut session, &property_config(dir.path())).unwrap_err();
    assert!(
        matches!(&err, ExploreError::Automaton(AutomatonError::UnknownProposition(p)) if p == "cs"),
        "{err:?}"
    );
}

#[test]
fn test_dpor_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = CheckerConfig {
        reduction: Some(Reduction::Dpor),
        ..property_config(dir.path())
    };
    let mut session = ToySession::new(spinning()).with_propositions(&["cs"]);
    let err = explore(&mut session, &config).unwrap_err();
    assert!(matches!(err, ExploreError::Config(_)), "{err:?}");
}
