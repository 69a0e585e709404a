//! Pawnbutler CLI — headless interface to the agent runtime.
//!
//! Subcommands: `start` the runtime, inspect `status`, tail `logs`, and
//! show or validate `config`. Exit code 0 on success, 1 on validation
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use pawnbutler_core::config::Config;
use pawnbutler_core::guardian::audit::{AuditFilter, AuditLog, AuditOutcome};
use pawnbutler_core::Runtime;

// ---------------------------------------------------------------------------
// Top-level CLI struct
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "pawnbutler",
    about = "Pawnbutler agent runtime CLI",
    version,
    long_about = "Headless interface to the Pawnbutler policy-and-isolation runtime."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: ~/.pawnbutler/config.json).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the runtime and run until interrupted.
    Start,
    /// Show runtime configuration and audit counters.
    Status,
    /// Print recent audit journal entries.
    Logs(LogsArgs),
    /// Show or validate the configuration file.
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
struct LogsArgs {
    /// Number of entries to print.
    #[arg(long, default_value_t = 50)]
    lines: usize,

    /// Which journal: audit | alerts.
    #[arg(long = "type", default_value = "audit", value_name = "TYPE")]
    journal: String,

    /// Filter by result: success | blocked | error.
    #[arg(long)]
    level: Option<String>,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Pretty-print the effective configuration.
    #[arg(long)]
    show: bool,

    /// Validate a config file at the given path instead of the default.
    #[arg(long, value_name = "PATH")]
    validate: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pawnbutler")
        .join("config.json")
}

fn load_config(path: &PathBuf) -> Result<Config, String> {
    let config = Config::load(path).map_err(|e| e.to_string())?;
    let problems = config.validate();
    if !problems.is_empty() {
        let mut message = format!("Configuration {} is invalid:\n", path.display());
        for problem in &problems {
            message.push_str(&format!("  - {}\n", problem));
        }
        return Err(message);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let outcome = match cli.command {
        Commands::Start => cmd_start(&config_path).await,
        Commands::Status => cmd_status(&config_path),
        Commands::Logs(args) => cmd_logs(&config_path, &args),
        Commands::Config(args) => cmd_config(&config_path, &args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message.trim_end());
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_start(config_path: &PathBuf) -> Result<(), String> {
    let config = load_config(config_path)?;
    let runtime = Runtime::from_config(config).map_err(|e| e.to_string())?;
    runtime.start().await.map_err(|e| e.to_string())?;

    println!("pawnbutler running (ctrl-c to stop)");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("signal handler failed: {}", e))?;

    runtime.shutdown().await.map_err(|e| e.to_string())?;
    Ok(())
}

fn cmd_status(config_path: &PathBuf) -> Result<(), String> {
    let config = load_config(config_path)?;

    println!("state dir:  {}", config.state_dir().display());
    println!("agents:");
    for entry in &config.agents {
        println!("  {:<16} {}", entry.id, entry.role);
    }

    let audit = AuditLog::new(config.audit_log_path(), config.alerts_path());
    match audit.summary() {
        Ok(summary) => {
            println!("audit:      {} entries ({} blocked, {} errors, {:.1}% block rate)",
                summary.total, summary.blocked, summary.errors, summary.block_rate * 100.0);
            let mut levels: Vec<_> = summary.by_level.iter().collect();
            levels.sort();
            for (level, count) in levels {
                println!("  {:<10} {}", level, count);
            }
        }
        Err(e) => println!("audit:      unreadable ({})", e),
    }
    Ok(())
}

fn cmd_logs(config_path: &PathBuf, args: &LogsArgs) -> Result<(), String> {
    let config = load_config(config_path)?;
    let audit = AuditLog::new(config.audit_log_path(), config.alerts_path());

    let result_filter = match args.level.as_deref() {
        None => None,
        Some("success") => Some(AuditOutcome::Success),
        Some("blocked") => Some(AuditOutcome::Blocked),
        Some("error") => Some(AuditOutcome::Error),
        Some(other) => return Err(format!("unknown --level '{}' (success|blocked|error)", other)),
    };

    let entries = match args.journal.as_str() {
        "audit" => audit
            .query(&AuditFilter { result: result_filter, limit: Some(args.lines), ..Default::default() })
            .map_err(|e| e.to_string())?,
        "alerts" => {
            let mut alerts = audit.read_alerts().map_err(|e| e.to_string())?;
            if let Some(filter) = result_filter {
                alerts.retain(|e| e.result == filter);
            }
            let skip = alerts.len().saturating_sub(args.lines);
            alerts.into_iter().skip(skip).collect()
        }
        other => return Err(format!("unknown --type '{}' (audit|alerts)", other)),
    };

    for entry in entries {
        println!(
            "{}  {:<10} {:<12} {:<20} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.result.as_str(),
            entry.agent_id,
            entry.action_type,
            entry.details.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_config(config_path: &PathBuf, args: &ConfigArgs) -> Result<(), String> {
    if let Some(path) = &args.validate {
        let config = Config::load(path).map_err(|e| e.to_string())?;
        let problems = config.validate();
        if problems.is_empty() {
            println!("{}: OK", path.display());
            return Ok(());
        }
        let mut message = format!("{}: {} problem(s)\n", path.display(), problems.len());
        for problem in &problems {
            message.push_str(&format!("  - {}\n", problem));
        }
        return Err(message);
    }

    let config = load_config(config_path)?;
    if args.show {
        let rendered = serde_json::to_string_pretty(&config).map_err(|e| e.to_string())?;
        println!("{}", rendered);
    } else {
        println!("{}", config_path.display());
        println!("valid: yes");
    }
    Ok(())
}
