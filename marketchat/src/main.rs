//! `MarketChat`: listing-scoped chat between buyers and sellers.
//!
//! Runs a line-oriented session against an in-process document store.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/marketchat/config.toml`).
//!
//! ```bash
//! # Start signed out
//! cargo run --bin marketchat
//!
//! # Sign in at startup
//! cargo run --bin marketchat -- --user u1 --name Ann
//! ```

use std::io::{self, Write};
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use marketchat::app::{App, Command, CommandError};
use marketchat::config::{CliArgs, ClientConfig};
use marketchat_docstore::MemoryBackend;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they don't interleave with the prompt.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("marketchat starting");

    let mut app = App::new(MemoryBackend::new(), config.clone());
    print_lines(&["MarketChat. Type /help for commands.".to_string()])?;

    if let Some(user) = config.user_id.clone() {
        let name = config.display_name.clone().unwrap_or_else(|| user.clone());
        let out = app.execute(Command::Login { user, name }).await;
        print_lines(&out)?;
    }

    run(&mut app, &config).await?;

    app.shutdown();
    tracing::info!("marketchat exiting");
    Ok(())
}

/// Reads commands from stdin and prints live updates between them.
async fn run(app: &mut App, config: &ClientConfig) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(config.poll_interval);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    Ok(command) => {
                        let out = app.execute(command).await;
                        print_lines(&out)?;
                    }
                    Err(CommandError::Empty) => {}
                    Err(e) => print_lines(&[e.to_string()])?,
                }
                if app.should_quit() {
                    break;
                }
            }
            _ = tick.tick() => {
                let out = app.poll_updates();
                print_lines(&out)?;
            }
        }
    }
    Ok(())
}

fn print_lines(lines: &[String]) -> io::Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut stdout = io::stdout().lock();
    for line in lines {
        writeln!(stdout, "{line}")?;
    }
    stdout.flush()
}

/// Initialize file-based logging.
///
/// Returns a guard that must be held for the lifetime of the program
/// to ensure logs are flushed. Returns `None` if the log path is unusable.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("marketchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
