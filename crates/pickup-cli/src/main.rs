//! pickup - command-line access to the school pickup backend.
//!
//! Signs in, keeps the session fresh, and shows what the app's identity
//! layer resolves for the signed-in account.

mod app;

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use pickup_core::Config;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;

// ============================================================================
// Constants
// ============================================================================

const USAGE: &str = "\
Usage: pickup <command>

Commands:
  login [email]        Sign in (prompts for the password)
  logout               Sign out and forget the saved session
  whoami [--json]      Show the signed-in user, invite status and parent id
  status               Show session expiry and identity cache state
  watch [seconds]      Re-resolve identity every second for a while (default 30)
  help                 Show this message

Environment:
  PICKUP_BACKEND_URL   Backend URL (overrides config)
  PICKUP_ANON_KEY      Project anon key (overrides config)
  RUST_LOG             Log filter, e.g. RUST_LOG=pickup_core=debug";

/// Default duration of `pickup watch`.
const DEFAULT_WATCH_SECS: u64 = 30;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login(Option<String>),
    Logout,
    Whoami { json: bool },
    Status,
    Watch(Duration),
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let rest: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    let command = match args.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => Command::Help,
        Some("login") => match rest.as_slice() {
            [] => Command::Login(None),
            [email] => Command::Login(Some(email.to_string())),
            _ => bail!("login takes at most one argument"),
        },
        Some("logout") if rest.is_empty() => Command::Logout,
        Some("whoami") => match rest.as_slice() {
            [] => Command::Whoami { json: false },
            ["--json"] => Command::Whoami { json: true },
            _ => bail!("unexpected arguments for whoami"),
        },
        Some("status") if rest.is_empty() => Command::Status,
        Some("watch") => match rest.as_slice() {
            [] => Command::Watch(Duration::from_secs(DEFAULT_WATCH_SECS)),
            [secs] => {
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| anyhow::anyhow!("watch duration must be a number of seconds"))?;
                Command::Watch(Duration::from_secs(secs))
            }
            _ => bail!("watch takes at most one argument"),
        },
        Some(other) => bail!("unknown command or arguments: {}", other),
    };
    Ok(command)
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when `log_dir` is usable, to a daily log file.
/// The returned guard must be held until exit so buffered lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("pickup")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let log_dir = config.cache_dir().ok().map(|dir| dir.join("logs"));
    let log_guard = init_tracing(log_dir.as_deref());
    if log_dir.is_some() && log_guard.is_none() {
        warn!("Log directory unavailable, logging to stderr only");
    }
    info!(?command, "pickup starting");

    let mut app = App::new(config)?;
    match command {
        Command::Login(email) => app.login(email).await?,
        Command::Logout => app.logout().await?,
        Command::Whoami { json } => app.whoami(json).await?,
        Command::Status => app.status().await?,
        Command::Watch(duration) => app.watch(duration).await?,
        Command::Help => unreachable!("help is handled before startup"),
    }

    info!("pickup finished");
    Ok(())
}
