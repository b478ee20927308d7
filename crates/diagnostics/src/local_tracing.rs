use std::{
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use pipe_trait::Pipe;
use tracing::Level;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter, Layer};

static IS_TRACING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Crates whose events are shown when `TRACE` is a bare level such as `TRACE=debug`.
const DEFAULT_TARGETS: &[&str] = &[
    "knit",
    "knit_fs",
    "knit_lockfile",
    "knit_modules_yaml",
    "knit_package_manager",
    "knit_store_controller",
];

/// Install a global tracing subscriber if the `TRACE` environment variable is set.
///
/// Calling this more than once is a no-op.
pub fn enable_tracing_by_env() {
    let Ok(trace_var) = std::env::var("TRACE") else {
        return;
    };

    if IS_TRACING_ENABLED.swap(true, Ordering::SeqCst) {
        return;
    }

    use tracing_subscriber::{fmt, prelude::*};
    let Some(layer) = common_layer(&trace_var) else {
        eprintln!("Invalid TRACE directive: {trace_var:?}");
        return;
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().pretty().with_file(true).with_span_events(FmtSpan::CLOSE))
        .init();
    tracing::trace!("enable_tracing_by_env");
}

fn common_layer(
    trace_var: &str,
) -> Option<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> {
    if let Ok(default_level) = Level::from_str(trace_var) {
        let targets = DEFAULT_TARGETS.iter().map(|target| (*target, default_level));
        return tracing_subscriber::filter::Targets::new().with_targets(targets).boxed().pipe(Some);
    }

    EnvFilter::builder().with_regex(true).parse(trace_var).ok().map(Layer::boxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_and_directives_are_accepted() {
        assert!(common_layer("debug").is_some());
        assert!(common_layer("knit::link=trace").is_some());
    }

    #[test]
    fn malformed_directive_is_rejected() {
        assert!(common_layer("knit=loudest").is_none());
    }
}
