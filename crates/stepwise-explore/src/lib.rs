//! State-space exploration for stepwise.
//!
//! The checked program runs as a separate process under a
//! [`ModelChecker`](stepwise_mc::ModelChecker). Whenever all of its actors
//! wait on a simcall, the explorer picks one transition, executes it, and
//! records the state reached. Backtracking restores an earlier state from a
//! snapshot or by replaying the path to it from the initial state.
//!
//! # Checkers
//!
//! ```text
//! safety                  every interleaving, DPOR-reduced by default;
//!                         assertion failures, deadlocks, crashes and
//!                         (with termination checking) non-progressive cycles
//! communication           compares the messages each actor sends and
//! determinism             receives against the first complete path
//! liveness                nested DFS over (Büchi automaton state, system
//!                         state) pairs; accepting cycles violate the property
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use stepwise_explore::config::CheckerConfig;
//! use stepwise_explore::remote_session::RemoteSession;
//! use stepwise_explore::report::format_report;
//!
//! let config = CheckerConfig {
//!     max_depth: 200,
//!     ..Default::default()
//! };
//! let mut session = RemoteSession::launch("./pingpong", &["--actors", "2"], &config).unwrap();
//! let report = stepwise_explore::checker::explore(&mut session, &config).unwrap();
//!
//! println!("{}", format_report(&report));
//! std::process::exit(report.exit_status().code());
//! ```
//!
//! # Module Structure
//!
//! - [`session`] — The [`Session`] seam between checkers and the checked system
//! - [`remote_session`] — [`Session`] over a real checked process
//! - [`state`] — Exploration states and request selection
//! - [`request`] — Simcall dependency relation and rendering
//! - [`visited`] — Visited states for state-equality reduction
//! - [`safety`], [`comm_determinism`], [`liveness`] — The checkers
//! - [`automaton`] — Never-claim parser for liveness properties
//! - [`record`] — Replayable paths
//! - [`dot`] — Graphviz output of the explored graph
//! - [`report`] — Violation and exploration reports
//!
//! # Determinism
//!
//! Exploration order depends only on the checked program: actors are
//! always considered in pid order and every map is a `BTreeMap`.

pub mod automaton;
pub mod checker;
pub mod comm_determinism;
pub mod config;
pub mod dot;
pub mod liveness;
pub mod record;
pub mod remote_session;
pub mod report;
pub mod request;
pub mod safety;
pub mod session;
pub mod state;
pub mod visited;

// Re-export main types for convenience
pub use automaton::{Automaton, AutomatonError, Label};
pub use checker::{explore, Checker, ExploreError};
pub use comm_determinism::CommDeterminismChecker;
pub use config::{CheckerConfig, CheckerMode, Reduction};
pub use liveness::LivenessChecker;
pub use record::{replay, RecordError, RecordTrace};
pub use remote_session::RemoteSession;
pub use report::{
    format_report, ExplorationReport, ExplorationStats, ViolationKind, ViolationReport,
};
pub use safety::SafetyChecker;
pub use session::{ActorInfo, Session, Transition};
pub use state::State;
pub use visited::{VisitedState, VisitedStates};
