//! Session configuration.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::MutationTemplate;
use crate::planning::DEFAULT_EXACT_THRESHOLD;

/// Smallest per-round execution window.
pub const DEFAULT_MIN_ROUND_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for one mutation session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Upper bound on concurrently running rounds. Capped at the replica count.
    pub max_concurrency: usize,
    /// Explicit timeout base. When unset, the coverage pass duration is used.
    pub round_timeout: Option<Duration>,
    /// Floor for the derived per-round timeout.
    pub min_round_timeout: Duration,
    /// Input size above which planning switches to the greedy strategy.
    pub exact_threshold: usize,
    /// Optional JSONL event log.
    pub events_path: Option<PathBuf>,
    /// Analyzers whose mutations are never scheduled.
    #[serde(default)]
    pub excluded_analyzers: BTreeSet<String>,
    /// Opcode substitution ids (e.g. `add_sub`) that are never scheduled.
    #[serde(default)]
    pub excluded_mutations: BTreeSet<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let max_concurrency = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            max_concurrency,
            round_timeout: None,
            min_round_timeout: DEFAULT_MIN_ROUND_TIMEOUT,
            exact_threshold: DEFAULT_EXACT_THRESHOLD,
            events_path: None,
            excluded_analyzers: BTreeSet::new(),
            excluded_mutations: BTreeSet::new(),
        }
    }
}

impl SessionConfig {
    /// Set the concurrency bound. Zero is treated as one.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Set an explicit timeout base.
    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.round_timeout = Some(round_timeout);
        self
    }

    /// Set the timeout floor.
    pub fn with_min_round_timeout(mut self, min_round_timeout: Duration) -> Self {
        self.min_round_timeout = min_round_timeout;
        self
    }

    /// Set the exact/greedy planning threshold.
    pub fn with_exact_threshold(mut self, exact_threshold: usize) -> Self {
        self.exact_threshold = exact_threshold;
        self
    }

    /// Set the event log path.
    pub fn with_events_path(mut self, events_path: impl Into<PathBuf>) -> Self {
        self.events_path = Some(events_path.into());
        self
    }

    /// Exclude every mutation found by `analyzer`.
    pub fn with_excluded_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.excluded_analyzers.insert(analyzer.into());
        self
    }

    /// Exclude one opcode substitution, e.g. `add_sub`. Matching ignores case.
    pub fn with_excluded_mutation(mut self, substitution: impl Into<String>) -> Self {
        self.excluded_mutations
            .insert(substitution.into().to_ascii_lowercase());
        self
    }

    /// True if the user excluded `template` by analyzer or by substitution.
    pub fn excludes(&self, template: &MutationTemplate) -> bool {
        self.excluded_analyzers.contains(&template.analyzer_name)
            || template
                .kind
                .substitution_id()
                .is_some_and(|id| self.excluded_mutations.contains(&id))
    }

    /// Concurrency actually used with `replicas` provisioned replicas.
    pub fn effective_concurrency(&self, replicas: usize) -> usize {
        self.max_concurrency.min(replicas).max(1)
    }

    /// Per-round timeout for a session whose coverage pass took `coverage_elapsed`.
    pub fn round_timeout_for(&self, coverage_elapsed: Duration) -> Duration {
        derive_round_timeout(
            self.round_timeout.unwrap_or(coverage_elapsed),
            self.min_round_timeout,
        )
    }
}

/// Double `base` and never go below `floor`.
pub fn derive_round_timeout(base: Duration, floor: Duration) -> Duration {
    base.saturating_mul(2).max(floor)
}
