mod replay;
mod scenario;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use timeline_core::TimelineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::replay::ReplayReport;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Replay and inspect entity timelines.
#[derive(Parser)]
#[command(name = "timeline", version, about = "Entity timeline reconciliation toolkit")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario of changes and work item steps against an in-memory store
    Replay {
        /// Path to the scenario JSON file
        scenario: PathBuf,
        /// Path to a TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a TOML configuration file
    CheckConfig {
        /// Path to the configuration file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Replay { scenario, config } => {
            cmd_replay(&scenario, config.as_deref(), cli.output);
        }
        Commands::CheckConfig { file } => {
            cmd_check_config(&file, cli.output);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn load_config(path: Option<&Path>, output: OutputFormat) -> TimelineConfig {
    let Some(path) = path else {
        return TimelineConfig::default();
    };
    match TimelineConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            report_error(&format!("config error: {e}"), output);
            process::exit(1);
        }
    }
}

fn cmd_replay(scenario_path: &Path, config_path: Option<&Path>, output: OutputFormat) {
    let config = load_config(config_path, output);
    let steps = match scenario::load(scenario_path) {
        Ok(steps) => steps,
        Err(e) => {
            report_error(&format!("{e:#}"), output);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to start runtime: {e}"), output);
            process::exit(1);
        }
    };
    let report = match runtime.block_on(replay::run(steps, config)) {
        Ok(report) => report,
        Err(e) => {
            report_error(&format!("replay error: {e}"), output);
            process::exit(1);
        }
    };

    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                report_error(&format!("failed to serialize report: {e}"), output);
                process::exit(1);
            }
        },
        OutputFormat::Text => print_report(&report),
    }

    if report.failed > 0 {
        process::exit(1);
    }
}

fn print_report(report: &ReplayReport) {
    for step in &report.steps {
        let status = if step.ok { "ok" } else { "FAIL" };
        match step.code {
            Some(code) => println!(
                "[{:>3}] {:<20} {status:<4} code={code} {}",
                step.index, step.op, step.detail
            ),
            None => println!(
                "[{:>3}] {:<20} {status:<4} {}",
                step.index, step.op, step.detail
            ),
        }
    }

    if !report.entities.is_empty() {
        println!();
        println!("Entities:");
        for entity in &report.entities {
            let state = entity.active_state.as_deref().unwrap_or("(gone)");
            println!(
                "  {:<32} {state:<8} {} history row(s)",
                entity.key, entity.history_rows
            );
        }
    }
    if !report.work_items.is_empty() {
        println!();
        println!("Work items:");
        for item in &report.work_items {
            let state = item.state.as_deref().unwrap_or("(done)");
            println!(
                "  {:<6} {state:<20} {} history row(s)",
                item.id, item.history_rows
            );
        }
    }
    if !report.live_workers.is_empty() {
        println!();
        println!("Live workers: {}", report.live_workers.join(", "));
    }

    println!();
    println!(
        "{} step(s), {} failed",
        report.steps.len(),
        report.failed
    );
}

fn cmd_check_config(file: &Path, output: OutputFormat) {
    let config = load_config(Some(file), output);
    match output {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "valid": true,
                "slack_window_us": config.reconcile.slack_window_us,
                "max_timestamp_probes": config.reconcile.max_timestamp_probes,
                "coalesce_checkpoints": config.work_items.coalesce_checkpoints,
            });
            println!("{value}");
        }
        OutputFormat::Text => {
            println!("{}: valid", file.display());
            println!("  slack_window_us      = {}", config.reconcile.slack_window_us);
            println!(
                "  max_timestamp_probes = {}",
                config.reconcile.max_timestamp_probes
            );
            println!(
                "  coalesce_checkpoints = {}",
                config.work_items.coalesce_checkpoints
            );
        }
    }
}

fn report_error(msg: &str, output: OutputFormat) {
    match output {
        OutputFormat::Text => eprintln!("error: {msg}"),
        OutputFormat::Json => eprintln!("{}", serde_json::json!({ "error": msg })),
    }
}
