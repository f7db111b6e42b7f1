//! cronwatch - watch a directory on a cron schedule

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cronwatch_watcher::{ConfigWatcher, ControllerOptions, WatchConfig, WatchController};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

const TIMESTAMP_FORMAT: &str = "[%Y-%m-%d %H:%M:%S]";

/// Watch a directory during cron-defined windows and report what changed
#[derive(Debug, Parser)]
#[command(name = "cronwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON file with `Path` and `Cron` keys, reloaded when it changes
    #[arg(long, default_value = "appsettings.json")]
    config: PathBuf,

    /// Directory that relative watch paths are resolved against
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Configuration changes closer together than this are ignored
    #[arg(long, default_value_t = 1000)]
    debounce_ms: u64,

    /// Longest single sleep of the activation timer, in seconds
    #[arg(long, default_value_t = 30)]
    tick_secs: u64,
}

impl Cli {
    fn options(&self) -> Result<ControllerOptions> {
        let base_dir = match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("cannot determine the current directory")?,
        };

        Ok(ControllerOptions::default()
            .with_base_dir(base_dir)
            .with_debounce(Duration::from_millis(self.debounce_ms))
            .with_max_tick(Duration::from_secs(self.tick_secs.max(1))))
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(false)
        .init();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("critical failure: {info}");
        std::process::exit(1);
    }));
}

async fn run(cli: Cli) -> Result<()> {
    let options = cli.options()?;
    let config = WatchConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    info!(
        "Loaded configuration from {}: path '{}', schedule '{}'",
        cli.config.display(),
        config.path.display(),
        config.cron
    );

    let (config_watcher, reloads) = ConfigWatcher::spawn(&cli.config)
        .with_context(|| format!("failed to watch {}", cli.config.display()))?;
    let config_file = config_watcher.file().to_path_buf();

    let controller = WatchController::new(config, options);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    controller
        .run(reloads, || WatchConfig::load(&config_file), shutdown)
        .await?;

    info!("cronwatch stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    install_panic_hook();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("critical failure: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["cronwatch"]);
        assert_eq!(cli.config, PathBuf::from("appsettings.json"));
        assert_eq!(cli.base_dir, None);

        let options = cli.options().unwrap();
        assert_eq!(options.debounce, Duration::from_secs(1));
        assert_eq!(options.max_tick, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "cronwatch",
            "--config",
            "/etc/cronwatch.json",
            "--base-dir",
            "/srv",
            "--debounce-ms",
            "250",
            "--tick-secs",
            "0",
        ]);
        let options = cli.options().unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/cronwatch.json"));
        assert_eq!(options.base_dir, PathBuf::from("/srv"));
        assert_eq!(options.debounce, Duration::from_millis(250));
        assert_eq!(options.max_tick, Duration::from_secs(1));
    }

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
