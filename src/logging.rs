//! Structured logging + build-progress bars (ambient addition, §1
//! "logger formatting" is an external collaborator, but wiring a subscriber
//! at all is still ours to do).
//!
//! Grounded on the registry/`EnvFilter`/`fmt::layer` composition pattern
//! used across the pack (e.g. `anvil`'s `init_tracing`), combined with the
//! teacher's own `tracing_indicatif` dependency (`engine/runner.rs`'s
//! `IndicatifSpanExt` usage on build spans) via `tracing_indicatif::IndicatifLayer`.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// `-v` bumps the default filter one level per occurrence, capped at
/// `trace`; `RUST_LOG` always wins if set (§6.5 "environment overrides").
pub fn init(verbosity: u8) {
    let default_directive = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}
