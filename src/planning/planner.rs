//! Pack bound mutations into test-disjoint rounds.
//!
//! Two mutations conflict when their test sets intersect or when they edit the same slot.
//! Every round is a conflict-free set, so one constrained test run verifies all of its
//! mutations at once. Fewer rounds means
//! fewer test-host invocations, which dominates session wall-clock time.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::binder::BoundMutation;
use crate::catalog::{GroupId, SlotKey};
use crate::coverage::TestName;

/// Input size above which the greedy planner is used.
pub const DEFAULT_EXACT_THRESHOLD: usize = 500;

/// Position of a round in the plan, from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u32);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A set of mutations whose covering tests are pairwise disjoint and whose target slots are
/// pairwise distinct.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    id: RoundId,
    members: Vec<BoundMutation>,
    tests: BTreeSet<TestName>,
    slots: BTreeSet<SlotKey>,
}

impl Round {
    fn open(id: RoundId) -> Self {
        Self {
            id,
            members: Vec::new(),
            tests: BTreeSet::new(),
            slots: BTreeSet::new(),
        }
    }

    /// Round id.
    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Mutations in admission order.
    pub fn members(&self) -> &[BoundMutation] {
        &self.members
    }

    /// Union of the members' covering tests.
    pub fn tests(&self) -> &BTreeSet<TestName> {
        &self.tests
    }

    /// Distinct group ids present in the round.
    pub fn group_ids(&self) -> BTreeSet<GroupId> {
        self.members.iter().map(|member| member.group_id).collect()
    }

    /// Number of mutations.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if the round holds no mutation.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Slots edited by the members.
    pub fn slots(&self) -> &BTreeSet<SlotKey> {
        &self.slots
    }

    /// True if `mutation` shares no test and no slot with the members.
    pub fn accepts(&self, mutation: &BoundMutation) -> bool {
        self.tests.is_disjoint(&mutation.tests)
            && !self.slots.contains(&mutation.template.slot_key())
    }

    fn admit(&mut self, mutation: BoundMutation) {
        self.tests.extend(mutation.tests.iter().cloned());
        self.slots.insert(mutation.template.slot_key());
        self.members.push(mutation);
    }
}

/// Planning algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStrategy {
    /// Repeatedly extract a maximal disjoint subset in catalog order. Quadratic.
    Exact,
    /// First-fit over buckets, largest test sets first. Near-linear.
    Greedy,
}

/// Round planner with a size threshold between the two strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Planner {
    exact_threshold: usize,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(DEFAULT_EXACT_THRESHOLD)
    }
}

impl Planner {
    /// Planner using the exact strategy for inputs of at most `exact_threshold` mutations.
    pub fn new(exact_threshold: usize) -> Self {
        Self { exact_threshold }
    }

    /// Strategy used for `count` mutations.
    pub fn strategy_for(&self, count: usize) -> PlanStrategy {
        if count > self.exact_threshold {
            PlanStrategy::Greedy
        } else {
            PlanStrategy::Exact
        }
    }

    /// Plan with the strategy chosen by input size.
    pub fn plan(&self, bound: impl IntoIterator<Item = BoundMutation>) -> Vec<Round> {
        let bound: Vec<_> = bound.into_iter().collect();
        let strategy = self.strategy_for(bound.len());
        self.plan_with(strategy, bound)
    }

    /// Plan with an explicit strategy.
    ///
    /// Mutations without covering tests cannot be verified and are left out.
    pub fn plan_with(
        &self,
        strategy: PlanStrategy,
        bound: impl IntoIterator<Item = BoundMutation>,
    ) -> Vec<Round> {
        let covered: Vec<_> = bound.into_iter().filter(BoundMutation::is_covered).collect();
        let count = covered.len();
        let rounds = match strategy {
            PlanStrategy::Exact => plan_exact(covered),
            PlanStrategy::Greedy => plan_greedy(covered),
        };
        info!(
            "planned {count} mutation(s) into {} round(s) using {strategy:?} strategy",
            rounds.len()
        );
        rounds
    }
}

/// Plan with the default threshold.
pub fn plan(bound: impl IntoIterator<Item = BoundMutation>) -> Vec<Round> {
    Planner::default().plan(bound)
}

fn plan_exact(mut remaining: Vec<BoundMutation>) -> Vec<Round> {
    let mut rounds = Vec::new();

    while !remaining.is_empty() {
        let mut free: HashSet<TestName> = remaining
            .iter()
            .flat_map(|mutation| mutation.tests.iter().cloned())
            .collect();
        let mut round = Round::open(RoundId(rounds.len() as u32 + 1));
        let mut leftover = Vec::with_capacity(remaining.len());

        let mut pending = remaining.into_iter();
        for mutation in pending.by_ref() {
            let tests_free = mutation.tests.iter().all(|test| free.contains(test));
            if tests_free && !round.slots.contains(&mutation.template.slot_key()) {
                for test in &mutation.tests {
                    free.remove(test);
                }
                round.admit(mutation);
            } else {
                leftover.push(mutation);
            }

            if free.is_empty() {
                break;
            }
        }
        leftover.extend(pending);

        debug!(
            "round {} admitted {} mutation(s), {} left",
            round.id,
            round.len(),
            leftover.len()
        );
        rounds.push(round);
        remaining = leftover;
    }

    rounds
}

fn plan_greedy(mut ordered: Vec<BoundMutation>) -> Vec<Round> {
    // Stable: equal sizes keep catalog order.
    ordered.sort_by(|a, b| b.tests.len().cmp(&a.tests.len()));

    let mut buckets: Vec<Round> = Vec::new();
    for mutation in ordered {
        match buckets
            .iter_mut()
            .find(|bucket| bucket.accepts(&mutation))
        {
            Some(bucket) => bucket.admit(mutation),
            None => {
                let mut bucket = Round::open(RoundId(buckets.len() as u32 + 1));
                bucket.admit(mutation);
                buckets.push(bucket);
            }
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::artifact::Constant;
    use crate::catalog::{MemberId, MutationKind, MutationTemplate};

    fn bound(ordinal: usize, group: u32, tests: &[&str]) -> BoundMutation {
        BoundMutation {
            ordinal,
            template: Arc::new(MutationTemplate {
                analyzer_name: "constant".to_string(),
                analyzer_description: String::new(),
                assembly: "Calc".to_string(),
                type_name: "Calc.Math".to_string(),
                method: Some(format!("M{ordinal}")),
                field: None,
                member_name: format!("M{ordinal}"),
                member: MemberId::new("Calc", ordinal as u32),
                enclosing_method: Some(MemberId::new("Calc", ordinal as u32)),
                kind: MutationKind::Constant {
                    original: Constant::Int(0),
                    replacement: Constant::Int(1),
                },
            }),
            tests: tests.iter().map(|test| test.to_string()).collect(),
            group_id: GroupId(group),
        }
    }

    // Field constant on `Limit`, reached from the method with handle `enclosing`.
    fn limit_constant(
        ordinal: usize,
        enclosing: u32,
        replacement: i64,
        tests: &[&str],
    ) -> BoundMutation {
        BoundMutation {
            ordinal,
            template: Arc::new(MutationTemplate {
                analyzer_name: "constant".to_string(),
                analyzer_description: String::new(),
                assembly: "Calc".to_string(),
                type_name: "Calc.Math".to_string(),
                method: Some(format!("M{enclosing}")),
                field: Some("Limit".to_string()),
                member_name: "Limit".to_string(),
                member: MemberId::new("Calc", 4),
                enclosing_method: Some(MemberId::new("Calc", enclosing)),
                kind: MutationKind::Constant {
                    original: Constant::Int(0),
                    replacement: Constant::Int(replacement),
                },
            }),
            tests: tests.iter().map(|test| test.to_string()).collect(),
            group_id: GroupId(1),
        }
    }

    fn ordinals(rounds: &[Round]) -> Vec<Vec<usize>> {
        rounds
            .iter()
            .map(|round| round.members().iter().map(|m| m.ordinal).collect())
            .collect()
    }

    #[test]
    fn shared_test_forces_separate_rounds() {
        let input = vec![bound(0, 1, &["T1", "T3"]), bound(1, 2, &["T2", "T3"])];
        for strategy in [PlanStrategy::Exact, PlanStrategy::Greedy] {
            let rounds = Planner::default().plan_with(strategy, input.clone());
            assert_eq!(ordinals(&rounds), vec![vec![0], vec![1]], "{strategy:?}");
        }
    }

    #[test]
    fn shared_slot_forces_separate_rounds() {
        let input = vec![
            limit_constant(0, 1, 1, &["t1"]),
            limit_constant(1, 2, 2, &["t2"]),
            bound(2, 2, &["t3"]),
        ];
        for strategy in [PlanStrategy::Exact, PlanStrategy::Greedy] {
            let rounds = Planner::default().plan_with(strategy, input.clone());
            assert_eq!(ordinals(&rounds), vec![vec![0, 2], vec![1]], "{strategy:?}");
            assert!(!rounds[0].accepts(&input[1]), "{strategy:?}");
            assert_eq!(rounds[1].slots().len(), 1);
        }
    }

    #[test]
    fn exact_packs_disjoint_mutations_in_catalog_order() {
        let input = vec![
            bound(0, 1, &["a"]),
            bound(1, 1, &["a", "b"]),
            bound(2, 2, &["b"]),
            bound(3, 2, &["c"]),
        ];
        let rounds = Planner::default().plan_with(PlanStrategy::Exact, input);
        assert_eq!(ordinals(&rounds), vec![vec![0, 2, 3], vec![1]]);
        assert_eq!(rounds[0].id(), RoundId(1));
        assert_eq!(rounds[1].id(), RoundId(2));
        assert_eq!(
            rounds[0].tests(),
            &BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn greedy_places_largest_test_sets_first() {
        let input = vec![
            bound(0, 1, &["a"]),
            bound(1, 1, &["a", "b"]),
            bound(2, 2, &["b"]),
            bound(3, 2, &["c"]),
        ];
        let rounds = Planner::default().plan_with(PlanStrategy::Greedy, input);
        assert_eq!(ordinals(&rounds), vec![vec![1, 3], vec![0, 2]]);
    }

    #[test]
    fn uncovered_mutations_are_left_out() {
        let input = vec![bound(0, 1, &[]), bound(1, 1, &["a"])];
        let rounds = plan(input);
        assert_eq!(ordinals(&rounds), vec![vec![1]]);
    }

    #[test]
    fn threshold_selects_strategy() {
        let planner = Planner::new(2);
        assert_eq!(planner.strategy_for(2), PlanStrategy::Exact);
        assert_eq!(planner.strategy_for(3), PlanStrategy::Greedy);
        assert_eq!(
            Planner::default().strategy_for(DEFAULT_EXACT_THRESHOLD + 1),
            PlanStrategy::Greedy
        );
    }

    #[test]
    fn round_reports_group_ids() {
        let rounds = plan(vec![bound(0, 4, &["a"]), bound(1, 4, &["b"]), bound(2, 7, &["c"])]);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].group_ids(), BTreeSet::from([GroupId(4), GroupId(7)]));
    }
}
