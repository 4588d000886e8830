//! Tracing bootstrap for applications embedding the SDK.
//!
//! The crate instruments itself with the `tracing` macros throughout; this
//! module installs a formatted subscriber for hosts that do not bring their
//! own. Gated behind the `trace-init` feature so library consumers keep full
//! control of their subscriber stack.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Installs the global subscriber at the given verbosity.
pub fn init_tracing_with(level: LevelFilter) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(level),
        )
        .init();
}

/// Installs the global subscriber at the default debug verbosity.
pub fn init_tracing() {
    init_tracing_with(LevelFilter::DEBUG);
}
