//! Coverage binding and round planning.
//!
//! Both steps are pure, synchronous, and deterministic for identical input.

pub mod binder;
pub mod planner;

pub use binder::{Binding, BoundMutation, bind, bind_with_index};
pub use planner::{DEFAULT_EXACT_THRESHOLD, PlanStrategy, Planner, Round, RoundId, plan};
