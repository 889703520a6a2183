//! Tracing setup for the rule engine.
//!
//! `RUST_LOG` wins when set. Otherwise the configured level is combined with
//! directives that cap HTTP-stack chatter at warn, so evaluation and
//! governance logs stay readable when the engine runs at debug.

use crate::config::TelemetryConfig;
use std::fmt;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Dependency targets quieted unless `RUST_LOG` overrides the whole filter.
const QUIETED_TARGETS: [&str; 3] = ["hyper=warn", "tower=warn", "mio=warn"];

#[derive(Debug)]
pub enum TelemetryError {
    BadDirective { directive: String, source: ParseError },
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::BadDirective { directive, .. } => {
                write!(f, "log filter directive '{directive}' does not parse")
            }
            TelemetryError::SubscriberInstall(err) => {
                write!(f, "tracing subscriber could not be installed: {err}")
            }
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TelemetryError::BadDirective { source, .. } => Some(source),
            TelemetryError::SubscriberInstall(err) => Some(&**err),
        }
    }
}

fn filter_from_config(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    let mut directive = config.log_level.clone();
    for target in QUIETED_TARGETS {
        directive.push(',');
        directive.push_str(target);
    }
    EnvFilter::try_new(&directive)
        .map_err(|source| TelemetryError::BadDirective { directive, source })
}

pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => filter_from_config(config)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_ansi(false)
        .try_init()
        .map_err(TelemetryError::SubscriberInstall)
}
