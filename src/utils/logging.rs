//! Tracing setup and rank-tagged instrumentation.
//!
//! Several ranks of one group usually live in a single process, so their
//! events interleave; [`rank_span`] tags everything a collective emits
//! with the caller's identity in the group. Filtering follows `RUST_LOG`;
//! rendering follows `INTRA_NODE_COMM_LOG_FORMAT`.

use std::str::FromStr;

use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

/// Rendering format for emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation.
    Json,
    /// Dense single-line output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Install the process-wide subscriber, reading the format from
/// `INTRA_NODE_COMM_LOG_FORMAT`. Absent or unknown values fall back to
/// [`LogFormat::Pretty`].
///
/// Returns false when a subscriber is already installed (tests, several
/// ranks initializing in one process); the existing one stays in effect.
pub fn init_logging() -> bool {
    let format = std::env::var("INTRA_NODE_COMM_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    init_logging_with_format(format)
}

/// Install the process-wide subscriber with an explicit format. Filtering
/// comes from `RUST_LOG`, defaulting to `info`.
pub fn init_logging_with_format(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => base.with_target(true).try_init().is_ok(),
        LogFormat::Json => base.json().flatten_event(true).try_init().is_ok(),
        LogFormat::Compact => base.compact().with_target(false).try_init().is_ok(),
    }
}

/// Span carrying the caller's group identity. Entered around every
/// collective so launch diagnostics from different ranks in the same
/// process stay attributable.
pub fn rank_span(rank: usize, world_size: usize) -> Span {
    info_span!("intra_node", rank, world_size)
}
