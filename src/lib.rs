//! # mutation-rounds
//!
//! `mutation-rounds` schedules mutation-testing work so that a large mutation catalog is
//! verified with as few constrained test-suite executions as possible:
//! - `coverage`: per-test coverage map, inverted member index, and the coverage record stream
//! - `catalog`: mutation kinds, templates, and replica-bound mutations
//! - `artifact`: the compiled representation a replica's mutations are applied to
//! - `planning`: binds coverage to mutations and packs them into test-disjoint rounds
//! - `session`: runs rounds concurrently against isolated project replicas (feature `session`)
//!
//! Planning is pure and synchronous. Execution is async and driven by Tokio.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod artifact;
pub mod catalog;
pub mod coverage;
pub mod planning;
pub mod prelude;

#[cfg(feature = "session")]
#[cfg_attr(docsrs, doc(cfg(feature = "session")))]
pub mod session;
