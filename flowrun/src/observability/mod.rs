//! Logging setup and span helpers.
//!
//! The engine logs through `tracing`. Hosts that do not install their own
//! subscriber can call [`init_tracing`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Span;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter};

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "flowrun=info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per event.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Installs a global subscriber filtered by `RUST_LOG`.
///
/// Returns `false` when a subscriber was already installed; calling this
/// twice is harmless.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Plain => registry.with(fmt_layer::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt_layer::layer().json()).try_init(),
    };
    result.is_ok()
}

/// Span covering one pipeline run.
#[must_use]
pub fn run_span(pipeline: &str, run_id: &str) -> Span {
    tracing::info_span!("pipeline_run", pipeline = %pipeline, run_id = %run_id)
}

/// Span covering one step execution, including retries.
#[must_use]
pub fn step_span(run_id: &str, step: &str) -> Span {
    tracing::debug_span!("step", run_id = %run_id, step = %step)
}
