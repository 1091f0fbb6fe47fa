use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use mutation_rounds::catalog::MutationGroup;
use mutation_rounds::coverage::{CoverageReport, decode_stream};
use mutation_rounds::planning::{Binding, BoundMutation, Planner, Round, bind};
use mutation_rounds::session::{
    LibtestHost, ProjectLayout, ReportFormat, SessionConfig, SessionInput, replay_events,
    run_session,
};

#[derive(Debug, Parser)]
#[command(name = "mutation-rounds")]
#[command(about = "Pack covered mutations into test-disjoint rounds and run them in parallel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bind coverage to the catalog and print the planned rounds.
    Plan {
        /// Coverage record stream.
        #[arg(long)]
        coverage: PathBuf,
        /// Mutation catalog (JSON list of groups).
        #[arg(long)]
        catalog: PathBuf,
        /// Mutation count above which the greedy planner is used.
        #[arg(long)]
        threshold: Option<usize>,
        /// Analyzer whose mutations are skipped. Repeatable.
        #[arg(long = "exclude-analyzer")]
        exclude_analyzers: Vec<String>,
        /// Opcode substitution to skip, e.g. `add_sub`. Repeatable.
        #[arg(long = "exclude-mutation")]
        exclude_mutations: Vec<String>,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
    /// Run a full session against replicas of a built project.
    Run {
        /// Built project directory copied into each replica.
        #[arg(long)]
        project: PathBuf,
        /// Test executable, relative to the project directory.
        #[arg(long)]
        test_executable: PathBuf,
        /// Assembly image, relative to the project directory. Repeatable.
        #[arg(long = "assembly", required = true)]
        assemblies: Vec<PathBuf>,
        /// Coverage record stream.
        #[arg(long)]
        coverage: PathBuf,
        /// Mutation catalog (JSON list of groups).
        #[arg(long)]
        catalog: PathBuf,
        /// Duration of the coverage pass, used as the timeout base.
        #[arg(long, default_value_t = 0)]
        coverage_elapsed_ms: u64,
        /// Number of replicas. Defaults to the number of CPUs.
        #[arg(long)]
        replicas: Option<usize>,
        /// Explicit timeout base in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Mutation count above which the greedy planner is used.
        #[arg(long)]
        threshold: Option<usize>,
        /// Append session events to this JSONL file and reuse its timed-out groups.
        #[arg(long)]
        events: Option<PathBuf>,
        /// Analyzer whose mutations are skipped. Repeatable.
        #[arg(long = "exclude-analyzer")]
        exclude_analyzers: Vec<String>,
        /// Opcode substitution to skip, e.g. `add_sub`. Repeatable.
        #[arg(long = "exclude-mutation")]
        exclude_mutations: Vec<String>,
        /// Extra argument passed to the test executable. Repeatable.
        #[arg(long = "test-arg", allow_hyphen_values = true)]
        test_args: Vec<String>,
        /// Output format.
        #[arg(long, value_enum, default_value = "md")]
        format: OutputFormat,
    },
    /// Summarize a session event log.
    Replay {
        /// Event log path.
        #[arg(long)]
        events: PathBuf,
        /// Emit JSON output.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Markdown
    Md,
    /// JSON
    Json,
}

fn with_exclusions(
    config: SessionConfig,
    analyzers: Vec<String>,
    mutations: Vec<String>,
) -> SessionConfig {
    let config = analyzers
        .into_iter()
        .fold(config, SessionConfig::with_excluded_analyzer);
    mutations
        .into_iter()
        .fold(config, SessionConfig::with_excluded_mutation)
}

fn load_catalog(path: &Path) -> Result<Vec<MutationGroup>> {
    let raw = fs::read(path).with_context(|| format!("reading catalog {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing catalog {}", path.display()))
}

fn load_coverage(path: &Path, elapsed: Duration) -> Result<CoverageReport> {
    let raw = fs::read(path).with_context(|| format!("reading coverage {}", path.display()))?;
    let map =
        decode_stream(&raw).with_context(|| format!("decoding coverage {}", path.display()))?;
    Ok(CoverageReport { map, elapsed })
}

fn plan_payload(planner: &Planner, binding: &Binding, rounds: &[Round]) -> serde_json::Value {
    let rounds: Vec<_> = rounds
        .iter()
        .map(|round| {
            let mutations: Vec<_> = round
                .members()
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "ordinal": m.ordinal,
                        "group_id": m.group_id,
                        "mutation": m.template.report(),
                        "tests": m.tests,
                    })
                })
                .collect();
            serde_json::json!({
                "round_id": round.id(),
                "tests": round.tests().len(),
                "mutations": mutations,
            })
        })
        .collect();
    let listed = |set: &[BoundMutation]| -> Vec<serde_json::Value> {
        set.iter()
            .map(|m| {
                serde_json::json!({
                    "ordinal": m.ordinal,
                    "group_id": m.group_id,
                    "mutation": m.template.report(),
                })
            })
            .collect()
    };
    serde_json::json!({
        "strategy": format!("{:?}", planner.strategy_for(binding.covered.len())).to_lowercase(),
        "mutations": binding.len(),
        "rounds": rounds,
        "uncovered": listed(&binding.uncovered),
        "excluded": listed(&binding.excluded),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Plan {
            coverage,
            catalog,
            threshold,
            exclude_analyzers,
            exclude_mutations,
            json,
        } => {
            let coverage = load_coverage(&coverage, Duration::ZERO)?;
            let catalog = load_catalog(&catalog)?;
            let mut config =
                with_exclusions(SessionConfig::default(), exclude_analyzers, exclude_mutations);
            if let Some(threshold) = threshold {
                config = config.with_exact_threshold(threshold);
            }

            let binding = Binding::partition(bind(&coverage.map, &catalog))
                .exclude(|template| config.excludes(template));
            let planner = Planner::new(config.exact_threshold);
            let rounds = planner.plan(binding.covered.iter().cloned());

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&plan_payload(&planner, &binding, &rounds))?
                );
            } else {
                println!(
                    "mutation-rounds: {} mutation(s), {} round(s), {} without coverage, {} excluded",
                    binding.len(),
                    rounds.len(),
                    binding.uncovered.len(),
                    binding.excluded.len()
                );
                for round in &rounds {
                    println!(
                        "{}\t{} mutation(s)\t{} test(s)",
                        round.id(),
                        round.len(),
                        round.tests().len()
                    );
                    for m in round.members() {
                        println!("  #{}\t{}\t{}", m.ordinal, m.group_id, m.template.report());
                    }
                }
                for m in &binding.uncovered {
                    println!("uncovered\t#{}\t{}\t{}", m.ordinal, m.group_id, m.template.report());
                }
                for m in &binding.excluded {
                    println!("excluded\t#{}\t{}\t{}", m.ordinal, m.group_id, m.template.report());
                }
            }
        }
        Command::Run {
            project,
            test_executable,
            assemblies,
            coverage,
            catalog,
            coverage_elapsed_ms,
            replicas,
            timeout_secs,
            threshold,
            events,
            exclude_analyzers,
            exclude_mutations,
            test_args,
            format,
        } => {
            if !project.is_dir() {
                bail!("project directory {} does not exist", project.display());
            }
            let coverage = load_coverage(&coverage, Duration::from_millis(coverage_elapsed_ms))?;
            let catalog = load_catalog(&catalog)?;

            let mut config =
                with_exclusions(SessionConfig::default(), exclude_analyzers, exclude_mutations);
            if let Some(threshold) = threshold {
                config = config.with_exact_threshold(threshold);
            }
            if let Some(timeout_secs) = timeout_secs {
                config = config.with_round_timeout(Duration::from_secs(timeout_secs));
            }
            if let Some(events) = events {
                config = config.with_events_path(events);
            }
            let replicas = replicas.unwrap_or(config.max_concurrency).max(1);
            config = config.with_max_concurrency(replicas);

            let layout = assemblies
                .into_iter()
                .fold(ProjectLayout::new(test_executable), ProjectLayout::with_assembly);
            let host = test_args
                .into_iter()
                .fold(LibtestHost::new(), LibtestHost::with_arg);

            let interrupt = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&interrupt);
            ctrlc::set_handler(move || {
                flag.store(true, Ordering::SeqCst);
                eprintln!("mutation-rounds: interrupt received, waiting for running rounds");
            })?;

            let input = SessionInput::provision(coverage, catalog, &project, &layout, replicas)
                .await?
                .with_interrupt(interrupt);
            let report = run_session(&config, input, host).await?;

            let format = match format {
                OutputFormat::Md => ReportFormat::Markdown,
                OutputFormat::Json => ReportFormat::Json,
            };
            println!("{}", report.render(format));
            eprintln!(
                "mutation-rounds: killed={}, survived={}, timeout={}, no_coverage={}, excluded={}, unresolved={}, score={}%",
                report.summary.killed,
                report.summary.survived,
                report.summary.timeout,
                report.summary.no_coverage,
                report.summary.excluded,
                report.summary.unresolved,
                report.summary.score
            );
        }
        Command::Replay { events, json } => {
            let replay = replay_events(&events)?;
            if json {
                let output = serde_json::json!({
                    "sessions": replay.sessions,
                    "completed_sessions": replay.completed_sessions,
                    "failed_rounds": replay.failed_rounds,
                    "malformed_lines": replay.malformed_lines,
                    "timed_out_groups": replay.timed_out_groups,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("sessions: {}", replay.sessions);
                println!("completed sessions: {}", replay.completed_sessions);
                println!("failed rounds: {}", replay.failed_rounds);
                println!("malformed lines: {}", replay.malformed_lines);
                let groups: Vec<String> = replay
                    .timed_out_groups
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                if groups.is_empty() {
                    println!("timed out groups: none");
                } else {
                    println!("timed out groups: {}", groups.join(", "));
                }
            }
        }
    }

    Ok(())
}
