//! Logging setup for treesync
//!
//! Console output always goes to stderr, since stdout may carry the wire
//! protocol. With `--debug-log`, a trace log file is also written to
//! `$TMPDIR/treesync-{session_id}.log`. The session ID is a UUID generated at
//! startup.

use std::path::PathBuf;

use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Debug log guard - keeps the file logger alive
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Session info returned after initializing debug logging
pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

fn console_level(verbose: bool) -> tracing_subscriber::filter::LevelFilter {
    if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    }
}

/// Console layer on stderr, stacked on whichever subscriber `init` builds
fn console_layer<S>(verbose: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_level(verbose))
}

/// Initialize console logging, plus a detailed log file when `to_file` is set.
///
/// The returned guard must be kept alive for the duration of the program.
pub fn init(verbose: bool, to_file: bool) -> Option<SessionInfo> {
    if !to_file {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer(verbose))
            .init();
        return None;
    }

    let session_id = uuid::Uuid::new_v4();
    let log_filename = format!("treesync-{session_id}.log");
    let log_dir = std::env::temp_dir();
    let log_path = log_dir.join(&log_filename);

    // Create non-blocking file appender
    let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // File layer: detailed debug output
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);

    // File filter: capture everything for treesync crates
    let file_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "warn,treesync=trace,treesync_core=trace,treesync_transport=trace",
        )
    });

    tracing_subscriber::registry()
        .with(file_filter)
        .with(file_layer)
        .with(console_layer(verbose))
        .init();

    Some(SessionInfo {
        log_path,
        guard: DebugLogGuard { _guard: guard },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Installs the global subscriber, so this is the only test that calls `init`
    #[test]
    fn test_session_log_is_written() {
        let session = init(true, true).unwrap();
        tracing::info!("session started");
        let SessionInfo { log_path, guard } = session;
        drop(guard);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("session started"));
        std::fs::remove_file(log_path).unwrap();
    }
}
