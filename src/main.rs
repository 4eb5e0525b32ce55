use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labtool::config;
use labtool::events::EventBus;
use labtool::lifecycle::{GadgetEngine, GadgetState};
use labtool::otg::{configfs, ConfigFsStore};
use labtool::shell::Shell;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// labtool command line arguments
#[derive(Parser, Debug)]
#[command(name = "labtool")]
#[command(version, about = "USB gadget lab tool: ISO emulation, virtual keyboard and image writing", long_about = None)]
struct CliArgs {
    /// Configuration file (default: $LABTOOL_CONFIG or /etc/labtool/labtool.toml)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory listed by `images` (overrides config)
    #[arg(short = 'i', long, value_name = "DIR")]
    image_dir: Option<PathBuf>,

    /// USB device controller to bind to (overrides config)
    #[arg(long, value_name = "UDC")]
    udc: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "warn")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting labtool v{}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("labtool must run as root to configure USB gadgets and write devices");
    }

    let config_path = config::config_path(args.config);
    let mut config = config::load(&config_path)?;
    if let Some(dir) = args.image_dir {
        config.paths.image_dir = dir;
    }
    if let Some(udc) = args.udc {
        config.gadget.udc = Some(udc);
    }
    tracing::debug!("Effective configuration: {:?}", config);

    if config.gadget.load_libcomposite {
        configfs::load_libcomposite();
    }

    let store = Arc::new(ConfigFsStore::from_config(&config.gadget));
    let events = EventBus::new();
    let engine = Arc::new(GadgetEngine::new(store, &config, events));

    match engine.recover().await {
        Ok(GadgetState::Error { reason }) => {
            tracing::warn!("Gadget could not be cleared at startup: {}", reason);
            eprintln!("warning: {} (use 'reset' to retry)", reason);
        }
        Ok(_) => tracing::info!("Gadget state reconciled"),
        Err(e) => tracing::warn!("Startup recovery failed: {}", e),
    }

    let shell = Shell::new(engine.clone(), config.paths.clone());
    let result = shell.run().await;

    engine.shutdown().await;
    tracing::info!("Bye");

    result.map_err(Into::into)
}

/// Initialize logging with the given level and verbosity
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "labtool=error",
        LogLevel::Warn => "labtool=warn",
        LogLevel::Info => "labtool=info",
        LogLevel::Verbose => "labtool=debug",
        LogLevel::Debug => "labtool=debug",
        LogLevel::Trace => "labtool=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Logs go to stderr so they do not interleave with shell output on stdout
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
