//! DPOR against exhaustive exploration on random message-passing programs.

mod common;

use common::{check, Op};
use proptest::prelude::*;
use stepwise_explore::config::{CheckerConfig, Reduction};

/// Start a send or a receive, then wait for it.
fn block() -> impl Strategy<Value = Vec<Op>> {
    (any::<bool>(), 0u64..2, 1u8..3).prop_map(|(send, mailbox, data)| {
        let start = if send {
            Op::Isend { mailbox, data }
        } else {
            Op::Irecv { mailbox }
        };
        vec![start, Op::Wait]
    })
}

fn program() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(block(), 1..3).prop_map(|blocks| blocks.concat())
}

/// A few actors, the first one checking what it received.
fn system() -> impl Strategy<Value = Vec<Vec<Op>>> {
    (
        prop::collection::vec(program(), 2..4),
        prop::collection::vec(1u8..3, 0..3),
    )
        .prop_map(|(mut programs, expected)| {
            programs[0].push(Op::AssertReceived(expected));
            programs
        })
}

fn config(reduction: Reduction) -> CheckerConfig {
    CheckerConfig {
        reduction: Some(reduction),
        ..CheckerConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn dpor_never_reports_unreachable_violations(programs in system()) {
        let dpor = check(programs.clone(), &config(Reduction::Dpor)).unwrap();
        let full = check(programs, &config(Reduction::None)).unwrap();

        if let Some(violation) = &dpor.violation {
            prop_assert!(
                full.violation.is_some(),
                "DPOR found {:?} along {}, exhaustive found nothing",
                violation.kind,
                violation.record_path
            );
        }
        if dpor.violation.is_none() && full.violation.is_none() {
            prop_assert!(dpor.stats.expanded_states <= full.stats.expanded_states);
        }
    }

    #[test]
    fn violation_paths_replay(programs in system()) {
        let report = check(programs.clone(), &config(Reduction::Dpor)).unwrap();
        if let Some(violation) = report.violation {
            let mut session = common::ToySession::new(programs);
            let outcome = stepwise_explore::replay(&mut session, &violation.record_path);
            match violation.kind {
                // Replaying stops right after the failing transition.
                stepwise_explore::ViolationKind::Safety => {
                    prop_assert!(
                        matches!(outcome, Err(stepwise_explore::ExploreError::Violation(_))),
                        "{:?}",
                        outcome
                    );
                }
                _ => prop_assert!(outcome.is_ok(), "{:?}", outcome),
            }
        }
    }
}
