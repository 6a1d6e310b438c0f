#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use clap::Parser;
use edgebot_core::app::{EdgeBot, LevelReloadFn};
use edgebot_core::config::{Config, LogFormat, LogLevel};
use edgebot_core::supervisor::ExitReason;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_SIGINT: u8 = 130;

/// Edge-side telemetry collector and shipper.
#[derive(Parser, Debug)]
#[command(name = "edgebot", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Parse and validate the configuration, then exit.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("edgebot: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        println!("configuration valid: {}", cli.config.display());
        println!("  node_id: {}", config.node_id);
        println!("  sink: {:?} -> {}", config.output.primary.kind, config.output.primary.url);
        println!("  inputs: syslog={} sim={}",
            config.inputs.syslog.enabled, config.inputs.sim.enabled);
        return ExitCode::from(EXIT_OK);
    }

    let level_reload = match install_subscriber(&config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("edgebot: failed to install logging: {err}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    info!(version = edgebot_core::VERSION, config = %cli.config.display(), "edgebot starting");
    let result = runtime.block_on(EdgeBot::new(config, cli.config).run(Some(level_reload)));

    match result {
        Ok(ExitReason::Normal) => ExitCode::from(EXIT_OK),
        Ok(ExitReason::Interrupted) => ExitCode::from(EXIT_SIGINT),
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Installs the tracing subscriber in the configured format and returns a
/// closure the SIGHUP path uses to retune the level at runtime.
fn install_subscriber(
    config: &Config,
) -> Result<LevelReloadFn, Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(filter_directive(config.log.level))?;
    let (filter, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?,
    }

    Ok(Box::new(move |level: LogLevel| {
        let directive = filter_directive(level);
        match EnvFilter::try_new(&directive) {
            Ok(filter) => {
                if handle.reload(filter).is_ok() {
                    info!(%level, "log level reloaded");
                }
            }
            Err(err) => error!("cannot build log filter '{directive}': {err}"),
        }
    }))
}

/// Quiets chatty HTTP internals at every level.
fn filter_directive(level: LogLevel) -> String {
    format!("hyper=warn,h2=warn,rustls=warn,sled=warn,{}", level.as_filter_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["edgebot", "--config", "/etc/edgebot.yaml", "--dry-run"]);
        assert_eq!(cli.config, PathBuf::from("/etc/edgebot.yaml"));
        assert!(cli.dry_run);
    }

    #[test]
    fn filter_directive_includes_level() {
        assert!(filter_directive(LogLevel::Debug).ends_with("debug"));
        assert!(filter_directive(LogLevel::Error).contains("hyper=warn"));
    }
}
