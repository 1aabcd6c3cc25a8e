mod app;
mod cache;
mod config;
mod error;
mod event;
mod fallback;
mod maintenance;
mod net;
mod router;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline-first request interception and response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin server URL
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Cache version number to run as
  #[arg(long, global = true)]
  version_number: Option<u32>,

  /// Log filter, overrides RUST_LOG (e.g. "debug", "shellcache=trace")
  #[arg(long, global = true)]
  log_level: Option<String>,

  /// Also log to stderr
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the current version and pre-populate the app shell
  Install,
  /// Take over and activate the installed version
  Activate,
  /// GET a path or URL through the router
  Fetch {
    /// Origin-relative path or absolute URL
    target: String,
  },
  /// Run the age sweep and capacity check on the active namespace
  Clean,
  /// Show namespaces and lifecycle state
  Status,
}

/// Log to a file in the cache directory, and optionally to stderr.
fn init_tracing(log_dir: &Path, level: Option<&str>, stderr: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let filter = match level {
    Some(level) => EnvFilter::try_new(level).map_err(|e| eyre!("Invalid log level: {}", e))?,
    None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
  };

  let appender = tracing_appender::rolling::never(log_dir, "shellcache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.version_number {
    config.version = version;
  }

  let db_path = config.database_path()?;
  let log_dir = db_path
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."));
  let _guard = init_tracing(&log_dir, args.log_level.as_deref(), args.log_stderr)?;

  let app = app::App::new(config).await?;

  match args.command {
    Command::Install => {
      app.install().await?;
      println!("installed {}", app.status()?.current);
    }
    Command::Activate => {
      app.activate().await?;
      println!("activated {}", app.status()?.current);
    }
    Command::Fetch { target } => {
      let served = app.fetch(&target).await?;
      println!(
        "{} {} ({:?}, {} bytes)",
        served.response.status,
        served.source,
        served.decision,
        served.response.body.len()
      );
    }
    Command::Clean => {
      app.clean().await?;
      println!("clean requested");
    }
    Command::Status => {
      let status = app.status()?;
      println!("current: {} ({})", status.current, status.state);
      println!("serving: {}", status.serving.as_deref().unwrap_or("(none)"));
      for ns in status.namespaces {
        println!("  {:<32} {:<12} {} entries", ns.name, ns.state, ns.entry_count);
      }
    }
  }

  app.shutdown().await;
  Ok(())
}
