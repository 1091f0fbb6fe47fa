//! Concurrent round execution against isolated project replicas.
//!
//! Rounds come from [`crate::planning`]. The [`Coordinator`] dispatches them under a bounded
//! pool, each round leasing one replica from the [`ReplicaPool`] and running its tests through
//! a [`TestHost`]. Results are merged into a [`SessionState`] and turned into a
//! [`SessionReport`].

pub mod config;
pub mod coordinator;
pub mod events;
pub mod executor;
pub mod host;
pub mod replica;
pub mod report;
pub mod state;

pub use config::{DEFAULT_MIN_ROUND_TIMEOUT, SessionConfig, derive_round_timeout};
pub use coordinator::{
    Coordinator, SessionError, SessionInput, SessionProgress, SessionResult, run_session,
};
pub use events::{
    EventLog, EventLogError, EventLogReplay, EventSink, SessionEvent, append_event,
    now_timestamp_ms, replay_events, replay_timed_out_groups,
};
pub use executor::{Disposition, MutationAttempt, RoundError, RoundOutcome, execute_round};
pub use host::{
    LibtestHost, TestHost, TestHostError, TestOutcome, TestRunReport, TestRunRequest,
    parse_libtest_line,
};
pub use replica::{ProjectLayout, Replica, ReplicaError, ReplicaLease, ReplicaPool};
pub use report::{MutationReport, MutationStatus, ReportFormat, SessionReport, SessionSummary};
pub use state::{CoupledOutcome, SessionAggregate, SessionState};
