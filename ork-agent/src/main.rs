//! Resource guardian agent.
//!
//! Parses the CLI, wires up logging, resolves the kernel-cmdline loop
//! switches, and hands control to the engine. On a development node the
//! agent stays resident but idle.

use std::str::FromStr;

use clap::Parser;

use ork::{Config, Engine};

/// 0-ork — node resource guardian.
#[derive(Parser)]
#[command(name = "0-ork", version, about)]
struct Cli {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    level: String,
}

fn main() {
    let cli = Cli::parse();

    let Ok(level) = tracing::Level::from_str(&cli.level) else {
        eprintln!("invalid log level '{}'", cli.level);
        std::process::exit(2);
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match Config::from_kernel_cmdline() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("cannot resolve kernel cmdline ({e}); all loops enabled");
            Config::default()
        }
    };

    if !config.active() {
        tracing::warn!("development node: guardian disabled, idling");
        loop {
            std::thread::park();
        }
    }

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.run() {
        tracing::error!("failed to start loops: {e}");
        std::process::exit(1);
    }
}
