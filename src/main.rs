use std::{fs, io::IsTerminal, process::ExitCode};

use aws_login::{cli::Cli, constants, renewal::daemon::log_path};
use clap::Parser;
use tracing::{Level, subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = if cli.is_renewal_daemon() {
        init_daemon_logging(&cli.profile, cli.verbose).map(Some)
    } else {
        init_logging(cli.verbose).map(|()| None)
    };
    // Held until exit so buffered daemon log lines are flushed
    let _guard = match logging {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn level_for(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = level_for(verbose);

    // Allow RUST_LOG env var to override verbosity flag
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .with_file(verbose >= 3)
        .with_line_number(verbose >= 3)
        .compact()
        .finish();

    subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// The renewal daemon has no terminal; it logs to `<state dir>/<profile>.log`.
fn init_daemon_logging(profile: &str, verbose: u8) -> anyhow::Result<WorkerGuard> {
    let level = level_for(verbose).max(Level::INFO);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let state_dir = constants::get_state_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to determine state directory"))?;
    fs::create_dir_all(&state_dir)?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(&state_dir, profile))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(verbose >= 2)
        .finish();

    subscriber::set_global_default(subscriber)?;

    Ok(guard)
}
