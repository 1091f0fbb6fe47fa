//! Execute one round against one leased replica.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use super::host::{TestHost, TestHostError, TestOutcome, TestRunRequest};
use super::replica::{ReplicaError, ReplicaLease};
use crate::artifact::ArtifactError;
use crate::catalog::GroupId;
use crate::coverage::TestName;
use crate::planning::{BoundMutation, Round, RoundId};

/// What happened to one mutation of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-derived, applied and tested.
    Applied,
    /// Skipped because its group timed out earlier in the session.
    Excluded,
    /// Could not be re-derived against the replica.
    Unresolvable {
        /// Why re-derivation failed.
        reason: String,
    },
}

/// A round member with its disposition.
#[derive(Debug, Clone)]
pub struct MutationAttempt {
    /// The planned mutation.
    pub mutation: BoundMutation,
    /// What the executor did with it.
    pub disposition: Disposition,
}

/// Result of a round that ran to completion.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// Round id.
    pub round_id: RoundId,
    /// Index of the replica the round ran on.
    pub replica: usize,
    /// One entry per round member, in round order.
    pub attempts: Vec<MutationAttempt>,
    /// Outcome per executed test.
    pub outcomes: BTreeMap<TestName, TestOutcome>,
    /// Groups with at least one applied mutation whose tests did not complete.
    pub timed_out_groups: BTreeSet<GroupId>,
    /// Whether the test host was stopped at the time budget.
    pub host_timed_out: bool,
    /// Wall-clock duration of the round.
    pub duration: Duration,
}

impl RoundOutcome {
    /// Mutations that were applied and tested.
    pub fn applied(&self) -> impl Iterator<Item = &BoundMutation> {
        self.attempts
            .iter()
            .filter(|attempt| attempt.disposition == Disposition::Applied)
            .map(|attempt| &attempt.mutation)
    }

    /// Number of members with the given disposition kind.
    pub fn count(&self, predicate: impl Fn(&Disposition) -> bool) -> usize {
        self.attempts
            .iter()
            .filter(|attempt| predicate(&attempt.disposition))
            .count()
    }
}

/// Round failures. The coordinator counts them; they never abort a session.
#[derive(Debug, Error)]
pub enum RoundError {
    /// Loading, patching or flushing the replica's artifacts failed.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
    /// No replica could be leased or restored.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    /// The test host failed to run.
    #[error("test host error: {0}")]
    Host(#[from] TestHostError),
    /// The round task panicked.
    #[error("round task panicked: {0}")]
    Panicked(String),
}

/// Run `round` on the leased replica.
///
/// Members whose group is in `excluded` are skipped. The rest are re-derived against the
/// replica's own artifacts, applied and flushed, and only their covering tests are run under
/// `timeout`. The lease is consumed and released when this returns, on every path.
pub async fn execute_round<H>(
    round: &Round,
    mut lease: ReplicaLease,
    excluded: &BTreeSet<GroupId>,
    timeout: Duration,
    host: &H,
) -> Result<RoundOutcome, RoundError>
where
    H: TestHost,
{
    let started = Instant::now();
    let mut artifacts = lease.load_artifacts().await?;
    let mut attempts = Vec::with_capacity(round.len());
    let mut tests = BTreeSet::new();

    for member in round.members() {
        if excluded.contains(&member.group_id) {
            debug!(
                "round {} skips {} (group {} timed out earlier)",
                round.id(),
                member.template.report(),
                member.group_id
            );
            attempts.push(MutationAttempt {
                mutation: member.clone(),
                disposition: Disposition::Excluded,
            });
            continue;
        }

        let disposition = match member.template.instantiate(&artifacts) {
            Ok(mutation) => {
                mutation.apply(&mut artifacts)?;
                tests.extend(member.tests.iter().cloned());
                Disposition::Applied
            }
            Err(err) => {
                warn!(
                    "round {} cannot re-derive {} on replica {}: {err}",
                    round.id(),
                    member.template.report(),
                    lease.index()
                );
                Disposition::Unresolvable {
                    reason: err.to_string(),
                }
            }
        };
        attempts.push(MutationAttempt {
            mutation: member.clone(),
            disposition,
        });
    }

    if tests.is_empty() {
        debug!("round {} has nothing to run", round.id());
        return Ok(RoundOutcome {
            round_id: round.id(),
            replica: lease.index(),
            attempts,
            outcomes: BTreeMap::new(),
            timed_out_groups: BTreeSet::new(),
            host_timed_out: false,
            duration: started.elapsed(),
        });
    }

    lease.mark_dirty();
    let written = artifacts.flush().await?;
    debug!(
        "round {} flushed {written} image(s) to replica {}, running {} test(s)",
        round.id(),
        lease.index(),
        tests.len()
    );

    let report = host
        .run_tests(TestRunRequest {
            executable: lease.test_executable().to_path_buf(),
            working_dir: lease.root().to_path_buf(),
            tests: tests.clone(),
            timeout,
        })
        .await?;

    let missing = if report.timed_out {
        TestOutcome::Timeout
    } else {
        TestOutcome::NotRun
    };
    let outcomes: BTreeMap<TestName, TestOutcome> = tests
        .into_iter()
        .map(|test| {
            let outcome = report.outcomes.get(&test).copied().unwrap_or(missing);
            (test, outcome)
        })
        .collect();

    let timed_out_groups = attempts
        .iter()
        .filter(|attempt| attempt.disposition == Disposition::Applied)
        .filter(|attempt| {
            attempt
                .mutation
                .tests
                .iter()
                .any(|test| outcomes.get(test).is_some_and(|outcome| outcome.is_incomplete()))
        })
        .map(|attempt| attempt.mutation.group_id)
        .collect();

    Ok(RoundOutcome {
        round_id: round.id(),
        replica: lease.index(),
        attempts,
        outcomes,
        timed_out_groups,
        host_timed_out: report.timed_out,
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::artifact::{AssemblyImage, MemberImage, Slot};
    use crate::catalog::{MemberId, MutationGroup, MutationKind, MutationTemplate};
    use crate::coverage::CoverageMap;
    use crate::planning::{PlanStrategy, Planner, bind};
    use crate::session::host::TestRunReport;
    use crate::session::replica::{ProjectLayout, Replica, ReplicaPool};

    type Responder = Box<dyn Fn(&TestRunRequest) -> TestRunReport + Send + Sync>;

    struct ScriptedHost {
        calls: Mutex<Vec<TestRunRequest>>,
        respond: Responder,
    }

    impl ScriptedHost {
        fn new(respond: impl Fn(&TestRunRequest) -> TestRunReport + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn calls(&self) -> Vec<TestRunRequest> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl TestHost for ScriptedHost {
        async fn run_tests(&self, request: TestRunRequest) -> Result<TestRunReport, TestHostError> {
            let report = (self.respond)(&request);
            self.calls.lock().expect("calls lock").push(request);
            Ok(report)
        }
    }

    fn failing(names: &'static [&'static str]) -> impl Fn(&TestRunRequest) -> TestRunReport {
        move |request: &TestRunRequest| TestRunReport {
            outcomes: request
                .tests
                .iter()
                .map(|test| {
                    let outcome = if names.contains(&test.as_str()) {
                        TestOutcome::Failed
                    } else {
                        TestOutcome::Passed
                    };
                    (test.clone(), outcome)
                })
                .collect(),
            timed_out: false,
            elapsed: Duration::from_millis(5),
        }
    }

    fn image() -> AssemblyImage {
        AssemblyImage::new("Calc")
            .with_member(
                "Calc.Math",
                "Add",
                MemberImage {
                    handle: 1,
                    slots: BTreeMap::from([(2, Slot::OpCode("add".to_string()))]),
                },
            )
            .with_member(
                "Calc.Math",
                "Sub",
                MemberImage {
                    handle: 2,
                    slots: BTreeMap::from([(2, Slot::OpCode("sub".to_string()))]),
                },
            )
    }

    fn opcode(member: &str, handle: u32, from: &str, to: &str) -> MutationTemplate {
        MutationTemplate {
            analyzer_name: "arithmetic".to_string(),
            analyzer_description: String::new(),
            assembly: "Calc".to_string(),
            type_name: "Calc.Math".to_string(),
            method: Some(member.to_string()),
            field: None,
            member_name: member.to_string(),
            member: MemberId::new("Calc", handle),
            enclosing_method: Some(MemberId::new("Calc", handle)),
            kind: MutationKind::OpCode {
                offset: 2,
                original: from.to_string(),
                replacement: to.to_string(),
            },
        }
    }

    async fn pool(dir: &Path) -> ReplicaPool {
        std::fs::write(
            dir.join("calc.image.json"),
            serde_json::to_vec(&image()).expect("image should serialize"),
        )
        .expect("image should write");
        let layout = ProjectLayout::new("tests").with_assembly("calc.image.json");
        let replica = Replica::open(0, dir, &layout).await.expect("replica should open");
        ReplicaPool::from_replicas(vec![replica]).expect("pool should build")
    }

    fn single_round(catalog: Vec<MutationGroup>) -> Round {
        let coverage: CoverageMap = [
            ("add_works".to_string(), MemberId::new("Calc", 1)),
            ("sub_works".to_string(), MemberId::new("Calc", 2)),
        ]
        .into_iter()
        .collect();
        let mut rounds =
            Planner::default().plan_with(PlanStrategy::Exact, bind(&coverage, &catalog));
        assert_eq!(rounds.len(), 1);
        rounds.remove(0)
    }

    fn catalog() -> Vec<MutationGroup> {
        vec![
            MutationGroup {
                analyzer: "arithmetic".to_string(),
                mutations: vec![opcode("Add", 1, "add", "sub")],
            },
            MutationGroup {
                analyzer: "arithmetic".to_string(),
                mutations: vec![opcode("Sub", 2, "sub", "add")],
            },
        ]
    }

    fn fixture() -> TempDir {
        tempdir().expect("tempdir should be created")
    }

    #[tokio::test]
    async fn applies_flushes_and_runs_only_covering_tests() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let round = single_round(catalog());
        let host = ScriptedHost::new(failing(&["add_works"]));

        let lease = pool.acquire().await.expect("lease");
        let outcome = execute_round(&round, lease, &BTreeSet::new(), Duration::from_secs(5), &host)
            .await
            .expect("round should run");

        let calls = host.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].tests,
            BTreeSet::from(["add_works".to_string(), "sub_works".to_string()])
        );
        assert_eq!(outcome.outcomes["add_works"], TestOutcome::Failed);
        assert_eq!(outcome.outcomes["sub_works"], TestOutcome::Passed);
        assert!(outcome.timed_out_groups.is_empty());
        assert_eq!(outcome.applied().count(), 2);

        let on_disk: AssemblyImage = serde_json::from_slice(
            &std::fs::read(tmp.path().join("calc.image.json")).expect("image should read"),
        )
        .expect("image should parse");
        assert_eq!(
            on_disk.types["Calc.Math"].members["Add"].slots[&2],
            Slot::OpCode("sub".to_string())
        );
        assert_eq!(pool.releases(), 1);
    }

    #[tokio::test]
    async fn fully_excluded_round_runs_nothing_and_releases_replica() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let catalog = vec![
            MutationGroup {
                analyzer: "a".to_string(),
                mutations: Vec::new(),
            },
            MutationGroup {
                analyzer: "b".to_string(),
                mutations: vec![opcode("Add", 1, "add", "sub")],
            },
        ];
        let round = single_round(catalog);
        let host = ScriptedHost::new(failing(&[]));

        let lease = pool.acquire().await.expect("lease");
        let outcome = execute_round(
            &round,
            lease,
            &BTreeSet::from([GroupId(2)]),
            Duration::from_secs(5),
            &host,
        )
        .await
        .expect("round should run");

        assert!(host.calls().is_empty());
        assert!(outcome.outcomes.is_empty());
        assert_eq!(outcome.count(|d| *d == Disposition::Excluded), 1);
        assert_eq!(pool.leases(), 1);
        assert_eq!(pool.releases(), 1);

        let lease = pool.acquire().await.expect("replica should be free");
        assert!(!lease.is_dirty());
    }

    #[tokio::test]
    async fn incomplete_tests_flag_their_groups() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let round = single_round(catalog());
        let host = ScriptedHost::new(|request: &TestRunRequest| TestRunReport {
            outcomes: request
                .tests
                .iter()
                .filter(|test| test.as_str() == "add_works")
                .map(|test| (test.clone(), TestOutcome::Passed))
                .collect(),
            timed_out: true,
            elapsed: Duration::from_secs(5),
        });

        let lease = pool.acquire().await.expect("lease");
        let outcome = execute_round(&round, lease, &BTreeSet::new(), Duration::from_secs(5), &host)
            .await
            .expect("round should run");

        assert!(outcome.host_timed_out);
        assert_eq!(outcome.outcomes["sub_works"], TestOutcome::Timeout);
        assert_eq!(outcome.timed_out_groups, BTreeSet::from([GroupId(2)]));
    }

    #[tokio::test]
    async fn ignored_tests_flag_their_groups_like_hangs() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let round = single_round(catalog());
        // `sub_works` reports `ignored`, which the libtest host maps to `NotRun`.
        let host = ScriptedHost::new(|request: &TestRunRequest| TestRunReport {
            outcomes: request
                .tests
                .iter()
                .map(|test| {
                    let outcome = if test.as_str() == "sub_works" {
                        TestOutcome::NotRun
                    } else {
                        TestOutcome::Passed
                    };
                    (test.clone(), outcome)
                })
                .collect(),
            timed_out: false,
            elapsed: Duration::from_millis(5),
        });

        let lease = pool.acquire().await.expect("lease");
        let outcome = execute_round(&round, lease, &BTreeSet::new(), Duration::from_secs(5), &host)
            .await
            .expect("round should run");

        assert!(!outcome.host_timed_out);
        assert_eq!(outcome.outcomes["sub_works"], TestOutcome::NotRun);
        assert_eq!(outcome.timed_out_groups, BTreeSet::from([GroupId(2)]));
    }

    #[tokio::test]
    async fn unresolvable_mutations_do_not_fail_the_round() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let round = single_round(vec![MutationGroup {
            analyzer: "arithmetic".to_string(),
            mutations: vec![opcode("Add", 1, "add", "sub"), opcode("Sub", 2, "mul", "add")],
        }]);
        let host = ScriptedHost::new(failing(&[]));

        let lease = pool.acquire().await.expect("lease");
        let outcome = execute_round(&round, lease, &BTreeSet::new(), Duration::from_secs(5), &host)
            .await
            .expect("round should run");

        assert_eq!(outcome.applied().count(), 1);
        assert_eq!(
            outcome.count(|d| matches!(d, Disposition::Unresolvable { .. })),
            1
        );
        assert_eq!(host.calls()[0].tests, BTreeSet::from(["add_works".to_string()]));
    }

    #[tokio::test]
    async fn artifact_failure_fails_the_round_and_still_releases() {
        let tmp = fixture();
        let pool = pool(tmp.path()).await;
        let round = single_round(catalog());
        std::fs::write(tmp.path().join("calc.image.json"), b"{broken").expect("image should write");
        let host = Arc::new(ScriptedHost::new(failing(&[])));

        let lease = pool.acquire().await.expect("lease");
        let err = execute_round(&round, lease, &BTreeSet::new(), Duration::from_secs(5), host.as_ref())
            .await
            .expect_err("broken image should fail the round");
        assert!(matches!(err, RoundError::Artifact(_)));
        assert_eq!(pool.releases(), 1);
    }
}
