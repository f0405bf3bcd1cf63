mod app;
mod event;

use clap::Parser;
use clockvine::config::Config;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter
const LOG_VAR: &str = "CLOCKVINE_LOG";

#[derive(Parser, Debug)]
#[command(name = "clockvine")]
#[command(about = "Query REST resources through the clockvine cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clockvine/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: app::Command,
}

/// Set up logging. The returned guard flushes the file writer on drop.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
  let registry = tracing_subscriber::registry().with(filter);

  match log_file {
    Some(path) => {
      let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      registry
        .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      registry
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let app = app::App::new(config);
  app.run(args.command).await?;

  Ok(())
}
