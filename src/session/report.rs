//! Mutation status derivation and report rendering.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::coordinator::SessionResult;
use super::host::TestOutcome;
use super::state::CoupledOutcome;
use crate::catalog::GroupId;
use crate::planning::{Binding, BoundMutation, RoundId};

/// Final classification of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// At least one covering test failed.
    Killed,
    /// Every covering test passed.
    Survived,
    /// A covering test did not complete, or the mutation's group had timed out.
    Timeout,
    /// No test covers the mutation.
    NoCoverage,
    /// The user excluded the mutation by analyzer or substitution.
    Excluded,
    /// The mutation was never tested: its round failed, was not started, or it could not be
    /// re-derived.
    Unresolved,
}

impl MutationStatus {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Killed => "killed",
            Self::Survived => "survived",
            Self::Timeout => "timeout",
            Self::NoCoverage => "no_coverage",
            Self::Excluded => "excluded",
            Self::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported output formats for session reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Markdown summary.
    Markdown,
    /// JSON summary with all mutations inline.
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md" | "markdown" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown report format '{other}' (expected md or json)")),
        }
    }
}

/// Per-mutation report entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationReport {
    /// Catalog position.
    pub ordinal: usize,
    /// Group the mutation came from.
    pub group_id: GroupId,
    /// Analyzer that found it.
    pub analyzer: String,
    /// Owner and edit, e.g. `Calc.Math::Add: opcode @2 add -> sub`.
    pub description: String,
    /// Mutation kind label.
    pub kind: String,
    /// Final status.
    pub status: MutationStatus,
    /// Round the mutation was tested in.
    pub round_id: Option<RoundId>,
    /// Tests that ran against it.
    pub tests_run: Vec<String>,
    /// Tests that failed against it.
    pub tests_failed: Vec<String>,
    /// Why it could not be tested, when known.
    pub detail: Option<String>,
}

/// Aggregated session counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Mutations in the catalog.
    pub total: usize,
    /// Killed mutations.
    pub killed: usize,
    /// Survived mutations.
    pub survived: usize,
    /// Timed out mutations.
    pub timeout: usize,
    /// Mutations without coverage.
    pub no_coverage: usize,
    /// Mutations the user excluded.
    pub excluded: usize,
    /// Mutations never tested.
    pub unresolved: usize,
    /// Killed mutations as a whole percentage of the non-excluded total, rounded down.
    pub score: u32,
    /// Rounds planned.
    pub rounds: usize,
    /// Rounds that finished, failed ones included.
    pub completed_rounds: usize,
    /// Rounds that failed.
    pub failed_rounds: usize,
    /// Rounds not started.
    pub skipped_rounds: usize,
    /// Whether the session was interrupted.
    pub interrupted: bool,
    /// Groups excluded after timing out.
    pub timed_out_groups: Vec<GroupId>,
    /// Per-round timeout in milliseconds.
    pub round_timeout_ms: u64,
    /// Session wall-clock time in milliseconds.
    pub elapsed_ms: u64,
}

/// Everything needed to print a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    /// Counts.
    pub summary: SessionSummary,
    /// One entry per catalog mutation, in catalog order.
    pub mutations: Vec<MutationReport>,
}

impl SessionReport {
    /// Classify every mutation of `binding` using what the session observed.
    pub fn build(binding: &Binding, result: &SessionResult) -> Self {
        let mut observed: BTreeMap<usize, Vec<&CoupledOutcome>> = BTreeMap::new();
        for outcome in &result.outcomes {
            observed.entry(outcome.ordinal).or_default().push(outcome);
        }

        let mut mutations: Vec<MutationReport> = binding
            .covered
            .iter()
            .map(|mutation| {
                let outcomes = observed.get(&mutation.ordinal).map(Vec::as_slice).unwrap_or(&[]);
                let status = classify(outcomes, result.excluded.contains(&mutation.ordinal));
                let mut report = entry(mutation, status);
                report.round_id = outcomes.first().map(|o| o.round_id);
                report.tests_run = outcomes.iter().map(|o| o.test.clone()).collect();
                report.tests_failed = outcomes
                    .iter()
                    .filter(|o| o.outcome == TestOutcome::Failed)
                    .map(|o| o.test.clone())
                    .collect();
                report.detail = if let Some(reason) = result.unresolvable.get(&mutation.ordinal) {
                    Some(reason.clone())
                } else if result.excluded.contains(&mutation.ordinal) {
                    Some(format!("group {} timed out", mutation.group_id))
                } else {
                    None
                };
                report
            })
            .chain(
                binding
                    .uncovered
                    .iter()
                    .map(|mutation| entry(mutation, MutationStatus::NoCoverage)),
            )
            .chain(binding.excluded.iter().map(|mutation| {
                let mut report = entry(mutation, MutationStatus::Excluded);
                report.detail = Some("excluded by configuration".to_string());
                report
            }))
            .collect();
        mutations.sort_by_key(|m| m.ordinal);

        let count = |status: MutationStatus| mutations.iter().filter(|m| m.status == status).count();
        let total = mutations.len();
        let killed = count(MutationStatus::Killed);
        let excluded = count(MutationStatus::Excluded);
        let summary = SessionSummary {
            total,
            killed,
            survived: count(MutationStatus::Survived),
            timeout: count(MutationStatus::Timeout),
            no_coverage: count(MutationStatus::NoCoverage),
            excluded,
            unresolved: count(MutationStatus::Unresolved),
            score: score(killed, total - excluded),
            rounds: result.total_rounds,
            completed_rounds: result.completed_rounds,
            failed_rounds: result.failed_rounds,
            skipped_rounds: result.skipped_rounds,
            interrupted: result.interrupted,
            timed_out_groups: result.timed_out_groups.iter().copied().collect(),
            round_timeout_ms: millis(result.round_timeout),
            elapsed_ms: millis(result.elapsed),
        };

        Self { summary, mutations }
    }

    /// Status of the mutation at `ordinal`.
    pub fn status_of(&self, ordinal: usize) -> Option<MutationStatus> {
        self.mutations
            .iter()
            .find(|m| m.ordinal == ordinal)
            .map(|m| m.status)
    }

    /// Render in the requested format.
    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "summary": self.summary,
                "mutations": self.mutations,
            }))
            .expect("report JSON should serialize"),
            ReportFormat::Markdown => self.render_markdown(),
        }
    }

    fn render_markdown(&self) -> String {
        let s = &self.summary;
        let mut out = String::from("# Mutation Session\n\n");
        out.push_str(&format!(
            "- rounds: {}/{} completed, {} failed, {} skipped\n- interrupted: {}\n- round timeout: {}ms\n- elapsed: {}ms\n\n",
            s.completed_rounds, s.rounds, s.failed_rounds, s.skipped_rounds, s.interrupted,
            s.round_timeout_ms, s.elapsed_ms
        ));

        out.push_str("## Summary\n\n| metric | count |\n|---|---:|\n");
        out.push_str(&format!("| total | {} |\n", s.total));
        out.push_str(&format!("| killed | {} |\n", s.killed));
        out.push_str(&format!("| survived | {} |\n", s.survived));
        out.push_str(&format!("| timeout | {} |\n", s.timeout));
        out.push_str(&format!("| no coverage | {} |\n", s.no_coverage));
        out.push_str(&format!("| excluded | {} |\n", s.excluded));
        out.push_str(&format!("| unresolved | {} |\n", s.unresolved));
        out.push_str(&format!("| score | {}% |\n", s.score));

        if !s.timed_out_groups.is_empty() {
            let groups: Vec<String> = s.timed_out_groups.iter().map(ToString::to_string).collect();
            out.push_str(&format!("\nTimed out groups: {}\n", groups.join(", ")));
        }

        if !self.mutations.is_empty() {
            out.push_str("\n## Mutations\n\n| # | group | status | mutation | failed tests |\n|---:|---|---|---|---|\n");
            for m in &self.mutations {
                let failed = if m.tests_failed.is_empty() {
                    m.detail.clone().unwrap_or_default()
                } else {
                    m.tests_failed.join(", ")
                };
                out.push_str(&format!(
                    "| {} | {} | {} | `{}` | {} |\n",
                    m.ordinal, m.group_id, m.status, m.description, failed
                ));
            }
        }

        out
    }
}

fn entry(mutation: &BoundMutation, status: MutationStatus) -> MutationReport {
    MutationReport {
        ordinal: mutation.ordinal,
        group_id: mutation.group_id,
        analyzer: mutation.template.analyzer_name.clone(),
        description: mutation.template.report(),
        kind: mutation.template.kind.label().to_string(),
        status,
        round_id: None,
        tests_run: Vec::new(),
        tests_failed: Vec::new(),
        detail: None,
    }
}

// A failure anywhere kills the mutation, even when other tests of the same run hung.
fn classify(outcomes: &[&CoupledOutcome], excluded: bool) -> MutationStatus {
    if outcomes.iter().any(|o| o.outcome == TestOutcome::Failed) {
        MutationStatus::Killed
    } else if excluded || outcomes.iter().any(|o| o.outcome.is_incomplete()) {
        MutationStatus::Timeout
    } else if outcomes.is_empty() {
        MutationStatus::Unresolved
    } else {
        MutationStatus::Survived
    }
}

fn score(killed: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    u32::try_from(killed * 100 / total).unwrap_or(100)
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
