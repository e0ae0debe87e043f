use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, LogFormat};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             tilecache=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             tilecache=TRACE"
        }
    }
}

/// Initializes logging for the loader.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the
/// level specified in the configuration. Additionally, this toggles
/// `RUST_BACKTRACE` based on the [`enable_backtraces`] config value.
///
/// [`enable_backtraces`]: crate::config::Logging::enable_backtraces
pub fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if env::var("RUST_LOG").is_err() {
        let rust_log = get_rust_log(config.logging.level);
        env::set_var("RUST_LOG", rust_log);
    }

    let filter = EnvFilter::from_default_env();
    let subscriber = FmtSubscriber::new().with(filter);
    let format = Layer::new();
    match (config.logging.format, std::io::stderr().is_terminal()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.pretty()))
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.compact()))
        }
        (LogFormat::Json, _) => {
            tracing::subscriber::set_global_default(subscriber.with(format.json()))
        }
    }
    .expect("setting global default subscriber");
}
