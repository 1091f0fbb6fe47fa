//! Session coordinator: dispatches planned rounds over a bounded pool of replicas.
//!
//! Each round runs in its own Tokio task. A session-wide semaphore caps how many run at once
//! (never more than there are replicas), and every task merges its result into the shared
//! [`SessionState`]. Round failures are counted, logged and recorded; they never stop the
//! session.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinHandle};

use super::config::SessionConfig;
use super::events::{
    EventLog, EventLogError, EventSink, SessionEvent, now_timestamp_ms, replay_timed_out_groups,
};
use super::executor::{Disposition, RoundOutcome, execute_round};
use super::host::TestHost;
use super::replica::{ProjectLayout, ReplicaError, ReplicaPool};
use super::report::SessionReport;
use super::state::{CoupledOutcome, SessionState};
use crate::catalog::{GroupId, MutationGroup};
use crate::coverage::CoverageReport;
use crate::planning::{Binding, Planner, Round, RoundId, bind};

/// Rounds finished so far, failed ones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionProgress {
    /// Rounds that finished, successfully or not.
    pub completed: usize,
    /// Rounds planned.
    pub total: usize,
    /// Rounds that failed.
    pub failed: usize,
}

impl SessionProgress {
    /// True once every planned round has finished.
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Everything a session produced.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Coupled outcomes in catalog order.
    pub outcomes: Vec<CoupledOutcome>,
    /// Ordinals skipped because their group timed out.
    pub excluded: BTreeSet<usize>,
    /// Ordinals that could not be re-derived, with the reason.
    pub unresolvable: BTreeMap<usize, String>,
    /// Groups excluded by the end of the session.
    pub timed_out_groups: BTreeSet<GroupId>,
    /// Rounds planned.
    pub total_rounds: usize,
    /// Rounds that finished, failed ones included.
    pub completed_rounds: usize,
    /// Rounds that failed.
    pub failed_rounds: usize,
    /// Rounds never dispatched because of an interrupt.
    pub skipped_rounds: usize,
    /// Whether an interrupt stopped dispatching.
    pub interrupted: bool,
    /// Timeout applied to every round.
    pub round_timeout: Duration,
    /// Session wall-clock time.
    pub elapsed: Duration,
}

/// Setup failures. Failed rounds are not errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Replicas could not be provisioned.
    #[error("replica setup failed: {0}")]
    Replica(#[from] ReplicaError),
    /// The event log could not be opened, replayed or closed.
    #[error("event log failed: {0}")]
    EventLog(#[from] EventLogError),
}

/// Inputs of [`run_session`].
#[derive(Debug, Clone)]
pub struct SessionInput {
    /// Coverage pass result.
    pub coverage: CoverageReport,
    /// Mutation catalog, one entry per analyzer group.
    pub catalog: Vec<MutationGroup>,
    /// Replicas the rounds run on.
    pub pool: ReplicaPool,
    /// Raised to stop dispatching new rounds.
    pub interrupt: Arc<AtomicBool>,
}

impl SessionInput {
    /// Input over an existing pool.
    pub fn new(coverage: CoverageReport, catalog: Vec<MutationGroup>, pool: ReplicaPool) -> Self {
        Self {
            coverage,
            catalog,
            pool,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy `project` into `replicas` fresh replicas and build the input over them.
    pub async fn provision(
        coverage: CoverageReport,
        catalog: Vec<MutationGroup>,
        project: &Path,
        layout: &ProjectLayout,
        replicas: usize,
    ) -> Result<Self, SessionError> {
        let pool = ReplicaPool::provision(project, layout, replicas).await?;
        Ok(Self::new(coverage, catalog, pool))
    }

    /// Share an interrupt flag, e.g. one raised by a Ctrl-C handler.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Runs planned rounds concurrently and aggregates their results.
pub struct Coordinator<H> {
    host: Arc<H>,
    pool: ReplicaPool,
    max_concurrency: usize,
    round_timeout: Duration,
    interrupt: Arc<AtomicBool>,
    seeded: BTreeSet<GroupId>,
    events: EventSink,
    progress: Arc<watch::Sender<SessionProgress>>,
}

impl<H> Coordinator<H>
where
    H: TestHost + 'static,
{
    /// Coordinator running at most `max_concurrency` rounds at once, each under `round_timeout`.
    pub fn new(host: H, pool: ReplicaPool, max_concurrency: usize, round_timeout: Duration) -> Self {
        let (progress, _) = watch::channel(SessionProgress::default());
        Self {
            host: Arc::new(host),
            pool,
            max_concurrency,
            round_timeout,
            interrupt: Arc::new(AtomicBool::new(false)),
            seeded: BTreeSet::new(),
            events: EventSink::disabled(),
            progress: Arc::new(progress),
        }
    }

    /// Stop dispatching once `interrupt` is raised.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Start with `groups` already excluded, e.g. replayed from a previous session's log.
    pub fn with_timed_out_groups(mut self, groups: BTreeSet<GroupId>) -> Self {
        self.seeded = groups;
        self
    }

    /// Record session events to `sink`.
    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.events = sink;
        self
    }

    /// Progress updates, one after every finished round.
    pub fn subscribe(&self) -> watch::Receiver<SessionProgress> {
        self.progress.subscribe()
    }

    /// Number of rounds allowed to run at once.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.min(self.pool.len()).max(1)
    }

    /// Run every round and wait for all of them.
    pub async fn run(self, rounds: Vec<Round>) -> SessionResult {
        let started = Instant::now();
        let total = rounds.len();
        let mutations: usize = rounds.iter().map(Round::len).sum();
        let concurrency = self.concurrency();
        let state = Arc::new(SessionState::new(total, self.seeded.clone()));
        self.progress.send_replace(state.progress());

        info!(
            "session started: {total} round(s), {mutations} mutation(s), concurrency {concurrency}, round timeout {:?}",
            self.round_timeout
        );
        if !self.seeded.is_empty() {
            info!(
                "{} group(s) excluded from a previous session",
                self.seeded.len()
            );
        }
        self.events.emit(SessionEvent::SessionStarted {
            timestamp_ms: now_timestamp_ms(),
            rounds: total,
            mutations,
            excluded_groups: self.seeded.iter().copied().collect(),
        });

        let limit = Arc::new(Semaphore::new(concurrency));
        let mut handles: Vec<(RoundId, JoinHandle<()>)> = Vec::with_capacity(total);
        let mut skipped = 0;
        let mut interrupted = false;
        let mut pending = rounds.into_iter();

        while let Some(round) = pending.next() {
            let permit = match Arc::clone(&limit).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    skipped = 1 + pending.len();
                    break;
                }
            };
            if self.interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                skipped = 1 + pending.len();
                warn!("interrupted; {skipped} round(s) will not be started");
                break;
            }

            let task = RoundTask {
                host: Arc::clone(&self.host),
                pool: self.pool.clone(),
                state: Arc::clone(&state),
                events: self.events.clone(),
                progress: Arc::clone(&self.progress),
                timeout: self.round_timeout,
            };
            let round_id = round.id();
            handles.push((round_id, tokio::spawn(task.run(round, permit))));
        }

        for (round_id, handle) in handles {
            if let Err(err) = handle.await {
                let reason = join_failure(err);
                record_failure(&state, &self.events, &self.progress, round_id, &reason);
            }
        }

        let progress = state.progress();
        let aggregate = state.take();
        self.events.emit(SessionEvent::SessionCompleted {
            timestamp_ms: now_timestamp_ms(),
            completed: progress.completed,
            failed: progress.failed,
            skipped,
            interrupted,
        });
        info!(
            "session finished: {}/{} round(s) completed, {} failed, {skipped} skipped in {:?}",
            progress.completed,
            progress.total,
            progress.failed,
            started.elapsed()
        );

        SessionResult {
            outcomes: aggregate.outcomes,
            excluded: aggregate.excluded,
            unresolvable: aggregate.unresolvable,
            timed_out_groups: aggregate.timed_out_groups,
            total_rounds: total,
            completed_rounds: progress.completed,
            failed_rounds: progress.failed,
            skipped_rounds: skipped,
            interrupted,
            round_timeout: self.round_timeout,
            elapsed: started.elapsed(),
        }
    }
}

struct RoundTask<H> {
    host: Arc<H>,
    pool: ReplicaPool,
    state: Arc<SessionState>,
    events: EventSink,
    progress: Arc<watch::Sender<SessionProgress>>,
    timeout: Duration,
}

impl<H> RoundTask<H>
where
    H: TestHost + 'static,
{
    // The permit is held until the round's result is merged, so a later round always sees the
    // groups this one excluded when concurrency is 1.
    async fn run(self, round: Round, _permit: OwnedSemaphorePermit) {
        let result = match self.pool.acquire().await {
            Ok(lease) => {
                let excluded = self.state.excluded_groups();
                execute_round(&round, lease, &excluded, self.timeout, self.host.as_ref()).await
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(outcome) => self.merge(&round, &outcome),
            Err(err) => record_failure(
                &self.state,
                &self.events,
                &self.progress,
                round.id(),
                &err.to_string(),
            ),
        }
    }

    fn merge(&self, round: &Round, outcome: &RoundOutcome) {
        for group in self.state.record_timed_out(&outcome.timed_out_groups) {
            let members: Vec<String> = round
                .members()
                .iter()
                .filter(|member| member.group_id == group)
                .map(|member| member.template.report())
                .collect();
            warn!(
                "group {group} timed out in round {} ({}); excluded for the rest of the session",
                round.id(),
                members.join(", ")
            );
            self.events.emit(SessionEvent::GroupTimedOut {
                timestamp_ms: now_timestamp_ms(),
                group_id: group,
                round_id: round.id(),
                members,
            });
        }

        let progress = self.state.finish_round(outcome);
        self.events.emit(SessionEvent::RoundFinished {
            timestamp_ms: now_timestamp_ms(),
            round_id: outcome.round_id,
            replica: outcome.replica,
            applied: outcome.count(|d| *d == Disposition::Applied),
            excluded: outcome.count(|d| *d == Disposition::Excluded),
            unresolvable: outcome.count(|d| matches!(d, Disposition::Unresolvable { .. })),
            tests: outcome.outcomes.len(),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        });
        publish(&self.progress, progress);
    }
}

fn record_failure(
    state: &SessionState,
    events: &EventSink,
    progress: &watch::Sender<SessionProgress>,
    round_id: RoundId,
    reason: &str,
) {
    error!("round {round_id} failed: {reason}");
    let snapshot = state.fail_round();
    events.emit(SessionEvent::RoundFailed {
        timestamp_ms: now_timestamp_ms(),
        round_id,
        reason: reason.to_string(),
    });
    publish(progress, snapshot);
}

fn publish(progress: &watch::Sender<SessionProgress>, snapshot: SessionProgress) {
    info!(
        "progress: {}/{} round(s) done, {} failed",
        snapshot.completed, snapshot.total, snapshot.failed
    );
    progress.send_replace(snapshot);
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("round task panicked: {message}")
}

/// Bind, plan and run a whole session, then build its report.
///
/// When `config.events_path` names an existing log, groups it recorded as timed out start
/// excluded, and this session's events are appended to it.
pub async fn run_session<H>(
    config: &SessionConfig,
    input: SessionInput,
    host: H,
) -> Result<SessionReport, SessionError>
where
    H: TestHost + 'static,
{
    let SessionInput {
        coverage,
        catalog,
        pool,
        interrupt,
    } = input;

    let binding = Binding::partition(bind(&coverage.map, &catalog))
        .exclude(|template| config.excludes(template));
    let rounds = Planner::new(config.exact_threshold).plan(binding.covered.iter().cloned());
    info!(
        "{} mutation(s): {} covered in {} round(s), {} without coverage, {} excluded",
        binding.len(),
        binding.covered.len(),
        rounds.len(),
        binding.uncovered.len(),
        binding.excluded.len()
    );

    let seeded = match config.events_path.as_deref() {
        Some(path) if path.exists() => replay_timed_out_groups(path)?,
        _ => BTreeSet::new(),
    };
    let log = config
        .events_path
        .as_deref()
        .map(EventLog::create)
        .transpose()?;
    let sink = log.as_ref().map(EventLog::sink).unwrap_or_default();

    let round_timeout = config.round_timeout_for(coverage.elapsed);
    let concurrency = config.effective_concurrency(pool.len());
    let result = Coordinator::new(host, pool, concurrency, round_timeout)
        .with_interrupt(interrupt)
        .with_timed_out_groups(seeded)
        .with_event_sink(sink)
        .run(rounds)
        .await;

    if let Some(log) = log {
        let written = log.close().await?;
        info!("{written} event(s) appended to the session log");
    }

    Ok(SessionReport::build(&binding, &result))
}
