//! Shared session state owned by the coordinator.
//!
//! Concurrent round tasks only touch the aggregates through [`SessionState`]'s methods. Each
//! aggregate sits behind its own lock and every critical section is a pure in-memory merge.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::coordinator::SessionProgress;
use super::executor::{Disposition, RoundOutcome};
use super::host::TestOutcome;
use crate::catalog::{GroupId, MutationTemplate};
use crate::coverage::TestName;
use crate::planning::RoundId;

/// One test outcome attributed to the one mutation of its round that the test covers.
#[derive(Debug, Clone, PartialEq)]
pub struct CoupledOutcome {
    /// Catalog ordinal of the mutation.
    pub ordinal: usize,
    /// The mutation.
    pub mutation: Arc<MutationTemplate>,
    /// Group id of the mutation.
    pub group_id: GroupId,
    /// Round the outcome was observed in.
    pub round_id: RoundId,
    /// Test name.
    pub test: TestName,
    /// Test outcome.
    pub outcome: TestOutcome,
    /// Wall-clock duration of the round.
    pub round_duration: Duration,
}

impl CoupledOutcome {
    /// Couple every applied mutation of a finished round with its tests' outcomes.
    ///
    /// Rounds are test-disjoint, so each test maps to exactly one mutation.
    pub fn from_round(round: &RoundOutcome) -> Vec<Self> {
        round
            .applied()
            .flat_map(|mutation| {
                mutation.tests.iter().filter_map(move |test| {
                    let outcome = round.outcomes.get(test).copied()?;
                    Some(Self {
                        ordinal: mutation.ordinal,
                        mutation: Arc::clone(&mutation.template),
                        group_id: mutation.group_id,
                        round_id: round.round_id,
                        test: test.clone(),
                        outcome,
                        round_duration: round.duration,
                    })
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct RoundCounters {
    completed: usize,
    failed: usize,
}

#[derive(Debug, Default)]
struct Aggregate {
    outcomes: Vec<CoupledOutcome>,
    excluded: BTreeSet<usize>,
    unresolvable: BTreeMap<usize, String>,
}

/// Everything concurrent rounds contribute to, behind one access path.
#[derive(Debug)]
pub struct SessionState {
    total: usize,
    timed_out: Mutex<BTreeSet<GroupId>>,
    counters: Mutex<RoundCounters>,
    aggregate: Mutex<Aggregate>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionState {
    /// State for `total` rounds, starting with `timed_out` already excluded.
    pub fn new(total: usize, timed_out: BTreeSet<GroupId>) -> Self {
        Self {
            total,
            timed_out: Mutex::new(timed_out),
            counters: Mutex::new(RoundCounters::default()),
            aggregate: Mutex::new(Aggregate::default()),
        }
    }

    /// Snapshot of the excluded groups for a round about to start.
    pub fn excluded_groups(&self) -> BTreeSet<GroupId> {
        lock(&self.timed_out).clone()
    }

    /// Add timed-out groups. Returns the groups that were not excluded yet.
    ///
    /// The set only grows: a recorded group is never removed.
    pub fn record_timed_out(&self, groups: &BTreeSet<GroupId>) -> Vec<GroupId> {
        let mut timed_out = lock(&self.timed_out);
        groups
            .iter()
            .copied()
            .filter(|group| timed_out.insert(*group))
            .collect()
    }

    /// Merge a finished round and count it as completed.
    pub fn finish_round(&self, round: &RoundOutcome) -> SessionProgress {
        let coupled = CoupledOutcome::from_round(round);
        {
            let mut aggregate = lock(&self.aggregate);
            aggregate.outcomes.extend(coupled);
            for attempt in &round.attempts {
                match &attempt.disposition {
                    Disposition::Applied => {}
                    Disposition::Excluded => {
                        aggregate.excluded.insert(attempt.mutation.ordinal);
                    }
                    Disposition::Unresolvable { reason } => {
                        aggregate
                            .unresolvable
                            .insert(attempt.mutation.ordinal, reason.clone());
                    }
                }
            }
        }

        let mut counters = lock(&self.counters);
        counters.completed += 1;
        self.progress_of(&counters)
    }

    /// Count a failed round. Nothing from it reaches the aggregate.
    pub fn fail_round(&self) -> SessionProgress {
        let mut counters = lock(&self.counters);
        counters.completed += 1;
        counters.failed += 1;
        self.progress_of(&counters)
    }

    /// Current progress.
    pub fn progress(&self) -> SessionProgress {
        self.progress_of(&lock(&self.counters))
    }

    fn progress_of(&self, counters: &RoundCounters) -> SessionProgress {
        SessionProgress {
            completed: counters.completed,
            total: self.total,
            failed: counters.failed,
        }
    }

    /// Drain the aggregate. Outcomes come back in catalog order.
    pub fn take(&self) -> SessionAggregate {
        let aggregate = std::mem::take(&mut *lock(&self.aggregate));
        let mut outcomes = aggregate.outcomes;
        outcomes.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.test.cmp(&b.test)));
        SessionAggregate {
            outcomes,
            excluded: aggregate.excluded,
            unresolvable: aggregate.unresolvable,
            timed_out_groups: lock(&self.timed_out).clone(),
        }
    }
}

/// Everything merged into a [`SessionState`] over a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionAggregate {
    /// Coupled outcomes of every finished round.
    pub outcomes: Vec<CoupledOutcome>,
    /// Ordinals of mutations skipped because their group had timed out.
    pub excluded: BTreeSet<usize>,
    /// Ordinals of mutations that could not be re-derived, with the reason.
    pub unresolvable: BTreeMap<usize, String>,
    /// Every group excluded by the end of the session, seeded ones included.
    pub timed_out_groups: BTreeSet<GroupId>,
}
