//! Safety exploration over the in-process actor system.

mod common;

use common::{check, racing_senders, Op};
use stepwise_explore::config::{CheckerConfig, Reduction};
use stepwise_explore::{ExploreError, ViolationKind};
use stepwise_protocol::ExitStatus;

fn config(reduction: Reduction) -> CheckerConfig {
    CheckerConfig {
        reduction: Some(reduction),
        ..CheckerConfig::default()
    }
}

/// Two actors drawing two random values each, never communicating.
fn independent_randoms() -> Vec<Vec<Op>> {
    let draw = Op::Random { min: 0, max: 0 };
    vec![vec![draw.clone(), draw.clone()], vec![draw.clone(), draw]]
}

// ═══════════════════════════════════════════════════════════════════════
//  Violations
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_dpor_finds_message_race() {
    let report = check(racing_senders(), &config(Reduction::Dpor)).unwrap();
    let violation = report.violation.as_ref().expect("race not found");
    assert_eq!(violation.kind, ViolationKind::Safety);
    assert_eq!(violation.headline, "*** PROPERTY NOT VALID ***");
    assert!(!violation.record_path.is_empty());
    assert_eq!(report.exit_status(), ExitStatus::Safety);
}

#[test]
fn test_exhaustive_finds_message_race() {
    let report = check(racing_senders(), &config(Reduction::None)).unwrap();
    assert_eq!(report.violation.unwrap().kind, ViolationKind::Safety);
    assert_eq!(report.reduction, Reduction::None);
}

#[test]
fn test_ordered_senders_pass() {
    // Distinct mailboxes leave only one possible reception order.
    let programs = vec![
        vec![
            Op::Irecv { mailbox: 1 },
            Op::Wait,
            Op::Irecv { mailbox: 2 },
            Op::Wait,
            Op::AssertReceived(vec![1, 2]),
        ],
        vec![Op::Isend { mailbox: 1, data: 1 }, Op::Wait],
        vec![Op::Isend { mailbox: 2, data: 2 }, Op::Wait],
    ];
    for reduction in [Reduction::Dpor, Reduction::None] {
        let report = check(programs.clone(), &config(reduction)).unwrap();
        assert!(report.violation.is_none(), "{reduction}: {:?}", report.violation);
        assert_eq!(report.exit_status(), ExitStatus::Success);
    }
}

#[test]
fn test_deadlock_lists_locked_requests() {
    let programs = vec![
        vec![Op::Irecv { mailbox: 0 }, Op::Wait],
        vec![Op::Irecv { mailbox: 0 }, Op::Wait],
    ];
    let report = check(programs, &config(Reduction::Dpor)).unwrap();
    let violation = report.violation.as_ref().unwrap();
    assert_eq!(violation.kind, ViolationKind::Deadlock);
    assert_eq!(violation.headline, "**** DEADLOCK DETECTED ****");
    assert_eq!(violation.details[0], "Locked request:");
    assert_eq!(violation.details.len(), 3);
    assert!(violation.details[1].contains("(1)"));
    assert!(violation.details[2].contains("(2)"));
    assert_eq!(violation.trace.len(), 2);
    assert_eq!(report.exit_status(), ExitStatus::Deadlock);
}

#[test]
fn test_waitany_explores_every_ready_comm() {
    let programs = vec![
        vec![
            Op::Irecv { mailbox: 0 },
            Op::Irecv { mailbox: 1 },
            Op::WaitAny,
            Op::WaitAny,
            Op::AssertReceived(vec![1, 2]),
        ],
        vec![Op::Isend { mailbox: 0, data: 1 }, Op::Wait],
        vec![Op::Isend { mailbox: 1, data: 2 }, Op::Wait],
    ];
    let report = check(programs, &config(Reduction::None)).unwrap();
    assert_eq!(report.violation.unwrap().kind, ViolationKind::Safety);
}

#[test]
fn test_random_values_are_all_explored() {
    let programs = vec![
        vec![Op::Random { min: 0, max: 1 }],
        vec![Op::Random { min: 0, max: 1 }],
    ];
    let report = check(programs, &config(Reduction::None)).unwrap();
    assert!(report.violation.is_none());
    // Root, 2 draws of actor 1 then 2 of actor 2 on each, and the
    // symmetric order.
    assert_eq!(report.stats.expanded_states, 1 + 2 + 4 + 2 + 4);
}

// ═══════════════════════════════════════════════════════════════════════
//  Bounds and reductions
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_max_depth_bounds_infinite_runs() {
    let looping = vec![vec![Op::Random { min: 0, max: 0 }, Op::Goto(0)]];
    for max_depth in [5, 6] {
        let config = CheckerConfig {
            max_depth,
            ..config(Reduction::Dpor)
        };
        let report = check(looping.clone(), &config).unwrap();
        assert!(report.violation.is_none());
        assert_eq!(report.stats.executed_transitions, max_depth as u64);
        assert_eq!(report.stats.expanded_states, max_depth as u64 + 1);
    }
}

#[test]
fn test_max_depth_boundary() {
    // The assertion fails after irecv, isend and wait: three transitions.
    let programs = vec![
        vec![Op::Irecv { mailbox: 0 }, Op::Wait, Op::AssertReceived(vec![9])],
        vec![Op::Isend { mailbox: 0, data: 1 }, Op::Wait],
    ];

    let shallow = CheckerConfig {
        max_depth: 2,
        ..config(Reduction::Dpor)
    };
    let report = check(programs.clone(), &shallow).unwrap();
    assert!(report.violation.is_none());

    let exact = CheckerConfig {
        max_depth: 3,
        ..config(Reduction::Dpor)
    };
    let report = check(programs, &exact).unwrap();
    let violation = report.violation.unwrap();
    assert_eq!(violation.kind, ViolationKind::Safety);
    assert_eq!(violation.record_path.to_string(), "1;2;1");
}

#[test]
fn test_non_termination_detected() {
    let looping = vec![vec![Op::Random { min: 0, max: 0 }, Op::Goto(0)]];
    let config = CheckerConfig {
        termination: true,
        ..CheckerConfig::default()
    };
    let report = check(looping, &config).unwrap();
    let violation = report.violation.as_ref().unwrap();
    assert_eq!(violation.kind, ViolationKind::NonTermination);
    assert_eq!(violation.details, vec!["Non-progressive cycle: state 2 -> state 3"]);
    assert_eq!(report.exit_status(), ExitStatus::NonTermination);
}

#[test]
fn test_visited_states_prune_exploration() {
    let full = check(independent_randoms(), &config(Reduction::None)).unwrap();
    assert!(full.violation.is_none());
    // Every prefix of every interleaving of two 2-step actors.
    assert_eq!(full.stats.expanded_states, 19);

    let stateful = CheckerConfig {
        max_visited_states: 100,
        ..config(Reduction::None)
    };
    let reduced = check(independent_randoms(), &stateful).unwrap();
    assert!(reduced.violation.is_none());
    assert_eq!(reduced.stats.expanded_states, 13);
}

#[test]
fn test_dpor_skips_independent_interleavings() {
    // Sends on distinct mailboxes commute.
    let programs = vec![
        vec![Op::Isend { mailbox: 1, data: 1 }],
        vec![Op::Isend { mailbox: 2, data: 2 }],
    ];
    let dpor = check(programs.clone(), &config(Reduction::Dpor)).unwrap();
    let full = check(programs, &config(Reduction::None)).unwrap();
    assert!(dpor.violation.is_none());
    assert!(full.violation.is_none());
    assert_eq!(dpor.stats.expanded_states, 3);
    assert_eq!(full.stats.expanded_states, 5);
}

#[test]
fn test_dpor_keeps_dependent_interleavings() {
    let programs = vec![
        vec![Op::Isend { mailbox: 1, data: 1 }],
        vec![Op::Isend { mailbox: 1, data: 2 }],
    ];
    let dpor = check(programs, &config(Reduction::Dpor)).unwrap();
    assert_eq!(dpor.stats.expanded_states, 5);
}

#[test]
fn test_mutexes_need_exhaustive_exploration() {
    let programs = vec![
        vec![Op::Lock(1), Op::Unlock(1)],
        vec![Op::Lock(1), Op::Unlock(1)],
    ];
    let err = check(programs.clone(), &config(Reduction::Dpor)).unwrap_err();
    assert!(matches!(err, ExploreError::Unsupported(_)), "{err:?}");
    assert_eq!(err.exit_status(), ExitStatus::Error);

    let report = check(programs, &config(Reduction::None)).unwrap();
    assert!(report.violation.is_none());
}

#[test]
fn test_stateless_backtracking_replays_from_initial_state() {
    let mut session = common::ToySession::new(independent_randoms());
    let report = stepwise_explore::explore(&mut session, &config(Reduction::None)).unwrap();
    assert!(report.violation.is_none());
    assert_eq!(session.snapshots_taken, 0);
    assert!(report.stats.executed_transitions > report.stats.expanded_states - 1);

    let mut session = common::ToySession::new(independent_randoms());
    let checkpointed = CheckerConfig {
        checkpoint: 1,
        ..config(Reduction::None)
    };
    let report = stepwise_explore::explore(&mut session, &checkpointed).unwrap();
    assert_eq!(report.stats.executed_transitions, report.stats.expanded_states - 1);
    assert_eq!(session.snapshots_taken, report.stats.expanded_states);
}
