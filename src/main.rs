use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lisorch::clock::TokioClock;
use lisorch::config::LisorchConfig;
use lisorch::host::{Host, Role};
use lisorch::marker::{MarkerStore, StateMarker};
use lisorch::metrics::report::format_reduced;
use lisorch::metrics::{
    parse_log, FieldPattern, MetricSet, Reduction, SampleFilters, TestConfiguration,
};
use lisorch::orchestrator::{Orchestrator, Plan};
use lisorch::outcome::{aggregate_verdicts, Verdict};
use lisorch::poller::{PollConfig, PollResult, ReadinessPoller, WaitSpec};
use lisorch::state::RunStatus;

#[derive(Parser)]
#[command(
    name = "lisorch",
    about = "Distributed test orchestration for Linux Integration Services suites",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $LISORCH_CONFIG, /etc/lisorch/lisorch.toml)
    #[arg(long, global = true, env = "LISORCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run plan
    Run {
        /// Plan file (TOML)
        #[arg(long)]
        plan: PathBuf,

        /// Local file receiving the run's state marker
        #[arg(long, default_value = "state.txt")]
        marker: PathBuf,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Do not record the run in the history database
        #[arg(long)]
        no_history: bool,
    },

    /// Wait for a host's state marker
    Wait {
        /// Host address
        #[arg(long)]
        host: String,

        /// Accepted marker tokens
        #[arg(long, required = true, num_args = 1..)]
        accept: Vec<String>,

        /// Failure marker tokens (default: TestFailed TestAborted)
        #[arg(long, num_args = 1..)]
        fail: Vec<String>,

        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Time budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Parse a workload log and reduce its fields
    ParseLog {
        /// Log file path
        #[arg(long)]
        file: PathBuf,

        /// Field preset names (tx_pps, rx_pps, throughput_gbps, ...)
        #[arg(long, num_args = 1..)]
        field: Vec<String>,

        /// Custom fields as NAME=REGEX with one capture group
        #[arg(long, num_args = 1..)]
        pattern: Vec<String>,

        /// Role that produced the log
        #[arg(long, default_value = "sender")]
        role: String,

        /// Reduction: max, min, mean, sum, last
        #[arg(long, default_value = "mean")]
        reduce: String,

        /// Drop the zeros a tool prints before traffic starts
        #[arg(long)]
        discard_leading_zeroes: bool,

        /// Drop the first and last sample of each field
        #[arg(long)]
        trim_edges: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Fold sub-test verdicts into a final verdict
    Aggregate {
        /// Verdicts: passed, failed, skipped, aborted
        verdicts: Vec<String>,
    },

    /// Show recorded runs
    History {
        /// Show one run in detail
        #[arg(long)]
        id: Option<String>,

        /// Number of runs to list
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Serve run history over HTTP
    Serve {
        /// Bind address (overrides [api] bind)
        #[arg(long)]
        bind: Option<String>,
    },
}

/// Legacy status codes: 0 completed, 1 failed, 2 skipped, 3 aborted.
fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::from(1),
        RunStatus::Skipped => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = LisorchConfig::resolve(cli.config.as_deref())?;
    lisorch::logging::init(&config.logging);

    match cli.command {
        Commands::Run {
            plan,
            marker,
            json,
            no_history,
        } => {
            let plan = Plan::load(&plan)?;
            tracing::info!(plan = %plan.name, hosts = plan.hosts.len(), "Starting run");

            let executor = lisorch::remote::from_config(&config.executor);
            let orchestrator =
                Orchestrator::from_config(&config, executor, Arc::new(TokioClock::new()));
            let sink = orchestrator.marker_sink(&plan, &marker);
            let report = orchestrator.run(&plan, sink).await;

            if !no_history {
                let pool = lisorch::storage::open_pool(&config.storage.db_path)?;
                lisorch::storage::save_run(&pool, &report)?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== Run {} ({}) ===", report.state.name, report.state.id);
                for cfg in &report.configurations {
                    println!("[{}] {}", cfg.configuration, cfg.verdict.verdict);
                    for c in &cfg.criteria {
                        println!("  {}", lisorch::metrics::report::format_criterion(c));
                    }
                    for t in &cfg.terminations {
                        if let Some(e) = &t.error {
                            println!("  stop {} on {}: {}", t.process, t.host, e);
                        }
                    }
                }
                println!("Status: {}", report.state.status);
                if let Some(reason) = &report.state.reason {
                    println!("Reason: {}", reason);
                }
            }
            Ok(exit_code(report.status()))
        }
        Commands::Wait {
            host,
            accept,
            fail,
            interval,
            timeout,
        } => {
            let target = Host::new(host.clone(), host, Role::Other("peer".to_string()));
            target.validate().map_err(anyhow::Error::msg)?;

            let accept: Vec<StateMarker> = accept.iter().filter_map(|t| StateMarker::parse(t)).collect();
            let mut spec = WaitSpec::accept(accept);
            if !fail.is_empty() {
                spec = spec.with_fail(fail.iter().filter_map(|t| StateMarker::parse(t)).collect());
            }
            let mut poll = PollConfig::from_settings(&config.poll);
            if let Some(secs) = interval {
                poll.interval = Duration::from_secs(secs);
            }
            if let Some(secs) = timeout {
                poll.timeout = Duration::from_secs(secs);
            }

            let executor = lisorch::remote::from_config(&config.executor);
            let store = MarkerStore::new(executor, config.marker.path.clone());
            let clock = TokioClock::new();
            let result = ReadinessPoller::new(&store, &clock)
                .wait_for_state(&target, &spec, &poll)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(match result {
                PollResult::Ready { .. } => ExitCode::SUCCESS,
                PollResult::RemoteFailed { .. } => ExitCode::from(1),
                PollResult::TimedOut { .. } => ExitCode::from(3),
            })
        }
        Commands::ParseLog {
            file,
            field,
            pattern,
            role,
            reduce,
            discard_leading_zeroes,
            trim_edges,
            json,
        } => {
            let strategy: Reduction = reduce.parse().map_err(anyhow::Error::msg)?;
            let filters = SampleFilters {
                discard_leading_zeroes,
                trim_edges,
            };
            let mut patterns = Vec::new();
            for name in &field {
                patterns.push(FieldPattern::preset(name)?.with_filters(filters));
            }
            for entry in &pattern {
                let (name, regex) = entry
                    .split_once('=')
                    .with_context(|| format!("pattern '{}' is not NAME=REGEX", entry))?;
                patterns.push(FieldPattern::new(name, regex)?.with_filters(filters));
            }
            if patterns.is_empty() {
                anyhow::bail!("give at least one --field or --pattern");
            }

            let role: Role = role.parse()?;
            let samples = parse_log(&role, &TestConfiguration::default(), &file, &patterns)?;
            let mut set = MetricSet::new();
            set.extend(samples);

            let reduced: Vec<_> = patterns
                .iter()
                .map(|p| {
                    (
                        p.name.clone(),
                        lisorch::metrics::reduce(&set.select(&p.name, None, None), strategy),
                    )
                })
                .collect();
            if json {
                let mut out = serde_json::Map::new();
                for (name, r) in &reduced {
                    out.insert(name.clone(), serde_json::to_value(r)?);
                }
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (name, r) in &reduced {
                    println!("{} [{}]", format_reduced(name, r), strategy);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Aggregate { verdicts } => {
            let parsed = verdicts
                .iter()
                .map(|v| v.parse::<Verdict>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)?;
            let verdict = aggregate_verdicts(parsed);
            println!("{}", verdict);
            Ok(exit_code(RunStatus::from(verdict)))
        }
        Commands::History { id, limit } => {
            let pool = lisorch::storage::open_pool(&config.storage.db_path)?;
            match id {
                Some(id) => match lisorch::storage::get_run(&pool, &id)? {
                    Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                    None => {
                        println!("No run with id {}", id);
                        return Ok(ExitCode::from(1));
                    }
                },
                None => {
                    let runs = lisorch::storage::list_runs(&pool, limit)?;
                    if runs.is_empty() {
                        println!("No runs recorded.");
                    } else {
                        println!("{:<36} | {:<24} | {:<10} | Created", "Id", "Name", "Status");
                        println!("{:-<36}-|-{:-<24}-|-{:-<10}-|-{:-<25}", "", "", "", "");
                        for r in runs {
                            println!(
                                "{:<36} | {:<24} | {:<10} | {}",
                                r.id, r.name, r.status, r.created_at
                            );
                        }
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting lisorch API");
            lisorch::serve(&bind, &config.storage.db_path).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
