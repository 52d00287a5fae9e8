use clap::{Parser, Subcommand};
use exit_handshake::{harness, ExitGuard, HarnessConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Coordinate a process's exit with an external leak inspector through a
/// pair of marker files.
#[derive(Parser, Debug)]
#[command(name = "exit-handshake", version, about)]
pub struct Cli {
    /// Extra logging (marker polling, inspector invocation)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Act as a monitored process: perform the exit handshake from the environment
    Hook {
        /// Milliseconds to stay alive before exiting
        #[arg(long, default_value_t = 0)]
        linger_ms: u64,
    },
    /// Run a command under the handshake and inspect it before it exits
    Run {
        /// Config file path
        #[arg(short, long, default_value = "harness.toml")]
        config: PathBuf,

        /// Report file path (overrides config)
        #[arg(long)]
        report: Option<PathBuf>,

        /// Inspector command (overrides config)
        #[arg(long)]
        inspector: Option<String>,

        /// Seconds to wait for the process to reach exit (overrides config)
        #[arg(long)]
        ready_timeout: Option<u64>,

        /// Print the resolved config and exit without running
        #[arg(long)]
        dry_run: bool,

        /// Command to monitor
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Commands::Hook { linger_ms } => handle_hook(linger_ms).await,
        Commands::Run {
            config,
            report,
            inspector,
            ready_timeout,
            dry_run,
            command,
        } => {
            let mut harness_config = match HarnessConfig::load(&config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(2);
                }
            };
            if let Some(path) = report {
                harness_config.report.path = Some(path);
            }
            if let Some(cmd) = inspector {
                harness_config.inspector.command = cmd;
            }
            if let Some(secs) = ready_timeout {
                harness_config.timeouts.ready_timeout_secs = secs;
            }
            handle_run(&harness_config, &command, dry_run).await
        }
    };

    std::process::exit(code);
}

/// Handle `exit-handshake hook`.
///
/// The handshake runs as the final step; its outcome never changes the exit code.
async fn handle_hook(linger_ms: u64) -> i32 {
    let guard = ExitGuard::install();
    let linger = Duration::from_millis(linger_ms);

    // Only take over SIGINT when there is a handshake to abandon.
    match guard.cancel_token().filter(|_| guard.is_enabled()) {
        Some(token) => {
            tokio::select! {
                _ = tokio::time::sleep(linger) => {
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            tracing::warn!("interrupted, abandoning exit handshake");
                            token.cancel();
                        }
                    });
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::warn!(error = %e, "failed to listen for ctrl-c");
                    }
                    tracing::warn!("interrupted, skipping exit handshake");
                    token.cancel();
                }
            }
        }
        None => tokio::time::sleep(linger).await,
    }

    // Blocking wait; keep it off the runtime's async workers.
    let outcome = tokio::task::spawn_blocking(move || guard.finish()).await;
    match outcome {
        Ok(outcome) => tracing::debug!(?outcome, "hook finished"),
        Err(e) => tracing::error!(error = %e, "exit handshake task failed"),
    }
    0
}

/// Handle `exit-handshake run`.
async fn handle_run(config: &HarnessConfig, command: &[String], dry_run: bool) -> i32 {
    if dry_run {
        match toml::to_string_pretty(config) {
            Ok(rendered) => {
                println!("Dry run: resolved config for {}", command.join(" "));
                println!("{rendered}");
                return 0;
            }
            Err(e) => {
                eprintln!("Error: failed to render config: {e}");
                return 2;
            }
        }
    }

    match harness::run(config, command).await {
        Ok(report) => {
            match (report.leaks, report.leaked_bytes) {
                (Some(leaks), Some(bytes)) => println!(
                    "pid {}: {:?}, {} leaks for {} bytes",
                    report.pid, report.outcome, leaks, bytes
                ),
                _ => println!("pid {}: {:?}", report.pid, report.outcome),
            }
            if report.killed {
                println!("Monitored process was killed.");
            }
            report.outcome.exit_code()
        }
        Err(e) => {
            eprintln!("Error: {e}");
            2
        }
    }
}
