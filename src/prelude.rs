//! Prelude module for convenient imports.
//!
//! This module re-exports the most commonly used items from this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use mutation_rounds::prelude::*;
//! ```

pub use crate::artifact::{AssemblyImage, Constant, MemberImage, ReplicaArtifacts, Slot};
pub use crate::catalog::{
    GroupId, MemberId, Mutation, MutationGroup, MutationKind, MutationTemplate, SlotKey,
};
pub use crate::coverage::{
    CoverageMap, CoverageRecorder, CoverageReport, TestName, decode_stream, encode_stream,
};
pub use crate::planning::{
    Binding, BoundMutation, PlanStrategy, Planner, Round, RoundId, bind, plan,
};

#[cfg(feature = "session")]
pub use crate::session::{
    Coordinator, LibtestHost, MutationStatus, ProjectLayout, ReplicaPool, ReportFormat,
    SessionConfig, SessionInput, SessionProgress, SessionReport, SessionResult, TestHost,
    TestOutcome, TestRunReport, TestRunRequest, run_session,
};
