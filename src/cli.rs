use crate::config::builder::SandboxConfig;
use crate::config::loader::load_builder;
use crate::config::validator::check_system_support;
use crate::core::{CancellationToken, SandboxCommand};
use crate::exec::plan::build_plan;
use crate::kernel::signal::SignalHandler;
use crate::verdict::{ExecutionResult, TerminationCause};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command in the sandbox
    Run {
        /// Sandbox configuration (JSON)
        #[arg(long)]
        config: PathBuf,
        /// Wall clock time limit in seconds, overriding the configuration
        #[arg(long)]
        time_limit: Option<f64>,
        /// Print the full execution result as JSON
        #[arg(long)]
        json: bool,
        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the environment plan for a configuration
    Plan {
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate a configuration and report every problem found
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn load(path: &Path, time_limit: Option<f64>) -> Result<SandboxConfig> {
    let mut builder = load_builder(path)?;
    if let Some(seconds) = time_limit {
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("--time-limit must be a positive number of seconds");
        }
        let limit = Duration::try_from_secs_f64(seconds)
            .map_err(|_| anyhow::anyhow!("--time-limit {} is out of range", seconds))?;
        builder = builder.wall_time(limit);
    }
    Ok(builder.build()?)
}

/// Cancel `token` once SIGINT/SIGTERM/SIGHUP arrives. The watcher exits
/// with the process.
fn watch_shutdown(handler: SignalHandler, token: CancellationToken) {
    thread::spawn(move || loop {
        if handler.shutdown_requested() {
            log::warn!(
                "signal {} received, cancelling execution",
                handler.get_signal()
            );
            token.cancel();
            return;
        }
        if token.wait(SHUTDOWN_POLL) {
            return;
        }
    });
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    std::io::stdout().write_all(result.stdout.as_bytes())?;
    std::io::stderr().write_all(result.stderr.as_bytes())?;
    for diagnostic in &result.diagnostics {
        eprintln!("jailbox: {}", diagnostic);
    }
    match result.cause {
        TerminationCause::NaturalExit => {}
        TerminationCause::SpawnFailed => eprintln!(
            "jailbox: failed to start: {}",
            result.spawn_error.as_deref().unwrap_or("unknown error")
        ),
        TerminationCause::LimitExceeded => eprintln!(
            "jailbox: {} limit exceeded",
            result
                .limit_triggered
                .map(|kind| kind.to_string())
                .unwrap_or_default()
        ),
        cause => eprintln!("jailbox: {}", cause),
    }
    Ok(())
}

pub fn run() -> Result<()> {
    // Before any thread exists
    let handler = SignalHandler::init().map_err(|e| anyhow::anyhow!(e))?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            time_limit,
            json,
            command,
        } => {
            let sandbox = load(&config, time_limit)
                .with_context(|| format!("loading {}", config.display()))?;
            let token = CancellationToken::new();
            watch_shutdown(handler, token.clone());

            let result = crate::execute(&sandbox, &SandboxCommand::new(command), &token)?;
            log::info!(
                "[{}] {} (exit {:?}, {} ms)",
                result.instance_id,
                result.cause,
                result.exit_code,
                result.duration_ms.unwrap_or(0)
            );
            print_result(&result, json)?;
            std::process::exit(result.process_exit_code());
        }
        Commands::Plan { config } => {
            let sandbox =
                load(&config, None).with_context(|| format!("loading {}", config.display()))?;
            let plan = build_plan(&sandbox)?;
            println!("{}", serde_json::to_string_pretty(plan.actions())?);
            eprintln!("fingerprint: {}", plan.fingerprint());
            Ok(())
        }
        Commands::CheckConfig { config } => {
            load(&config, None).with_context(|| format!("checking {}", config.display()))?;
            println!("{}: ok", config.display());
            for missing in check_system_support() {
                eprintln!("warning: {}", missing);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config(name: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("jailbox-cli-{}-{}.json", name, std::process::id()));
        std::fs::write(&path, "{}").unwrap();
        path
    }

    #[test]
    fn test_huge_time_limit_is_an_error() {
        let path = empty_config("huge");
        let err = load(&path, Some(1e300)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(load(&path, Some(f64::INFINITY)).is_err());
        assert!(load(&path, Some(-1.0)).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_time_limit_overrides_config() {
        let path = empty_config("override");
        let config = load(&path, Some(1.5)).unwrap();
        assert_eq!(config.limits().wall_time(), Some(Duration::from_millis(1500)));
        std::fs::remove_file(&path).unwrap();
    }
}
