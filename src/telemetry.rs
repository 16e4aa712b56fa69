//! Tracing setup for binaries and tests embedding the engine. Filtering follows `RUST_LOG`.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global subscriber writing to `log_file`, or to stdout when none is given. Span events are recorded only
/// with `with_spans`.
pub fn init_tracing(log_file: Option<&Path>, with_spans: bool) -> anyhow::Result<()> {
    let writer = Mutex::new(if let Some(log_file) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_file)
            .with_context(|| format!("opening log file {}", log_file.display()))?;
        Box::new(file) as Box<dyn io::Write + Send>
    }
    else {
        Box::new(io::stdout()) as Box<dyn io::Write + Send>
    });

    let span_events = if with_spans { FmtSpan::NEW | FmtSpan::CLOSE } else { FmtSpan::NONE };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_span_events(span_events),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    info!("Tracing initialized");
    Ok(())
}
