//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, path::Path, sync::Once};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

static CHAINDUMP_LOG_ENV_VAR: &str = "CHAINDUMP_LOG";

/// File name prefix of the rolling log files written to the configured log directory.
const LOG_FILE_PREFIX: &str = "chaindump.log";

/// Initializes a tracing subscriber logging to stderr.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", log_level);
    });
}

/// Initializes a tracing subscriber logging both to stderr and to a daily rolling file in
/// `log_dir`.
///
/// The returned guard flushes the file writer when dropped and must be kept alive for the
/// lifetime of the process.
pub fn init_with_file(log_dir: &Path) -> WorkerGuard {
    let (env_filter, log_level) = env_filter_and_log_level();

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(stderr_layer.and_then(file_layer).with_filter(env_filter))
        .init();

    tracing::info!(log_dir = %log_dir.display(), "log level: {}", log_level);

    guard
}

/// List of crates in the workspace.
const WORKSPACE_CRATES: &[&str] = &[
    "chaindump",
    "common",
    "dump",
    "evm_rpc_datasets",
    "monitoring",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    let log_level =
        std::env::var(CHAINDUMP_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in WORKSPACE_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => eprintln!("ignoring invalid {CHAINDUMP_LOG_ENV_VAR} value: {err}"),
        }
    }

    (env_filter, log_level)
}

/// Renders the chain of sources below `err`, for use as a structured `error_source` log field.
///
/// Returns an empty string when the error has no source.
pub fn error_source(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain.join(" -> ")
}

/// Builds an error chain string from an error and its sources.
pub fn error_with_causes(err: &dyn std::error::Error) -> String {
    let sources = error_source(err);
    if sources.is_empty() {
        err.to_string()
    } else {
        format!("{err} | Caused by: {sources}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("middle")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn error_with_causes_walks_the_chain() {
        let err = Outer(Middle(std::io::Error::other("inner")));

        assert_eq!(error_source(&err), "middle -> inner");
        assert_eq!(
            error_with_causes(&err),
            "outer | Caused by: middle -> inner"
        );
    }

    #[test]
    fn error_without_source_renders_alone() {
        let err = std::io::Error::other("alone");

        assert_eq!(error_source(&err), "");
        assert_eq!(error_with_causes(&err), "alone");
    }
}
