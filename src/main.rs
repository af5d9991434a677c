mod commands;
mod config;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "marketsync")]
#[command(about = "Offline-tolerant client for a marketplace of versioned resources")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/marketsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Always go to the network for reads
  #[arg(long, global = true)]
  no_cache: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging();

  let config = config::Config::load(args.config.as_deref())?;

  commands::run(args.command, &config, !args.no_cache).await
}

/// Log to stderr, plus a file under the data dir when one can be created.
///
/// Filter with MARKETSYNC_LOG (e.g. `MARKETSYNC_LOG=marketsync=debug`).
fn init_logging() -> Option<WorkerGuard> {
  let filter = || {
    EnvFilter::try_from_env("MARKETSYNC_LOG")
      .unwrap_or_else(|_| EnvFilter::new("marketsync=info,warn"))
  };

  let log_dir = dirs::data_dir()
    .map(|d| d.join("marketsync"))
    .filter(|d| std::fs::create_dir_all(d).is_ok());

  match log_dir {
    Some(dir) => {
      let file_appender = tracing_appender::rolling::never(&dir, "marketsync.log");
      let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
      tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
      None
    }
  }
}
