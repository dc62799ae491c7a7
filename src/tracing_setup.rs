use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::models::{LogFormat, LoggingConfig};

/// Initialize logging from configuration.
///
/// `RUST_LOG`, when set, takes precedence over the configured level. Every
/// component logs inside its own span (see [`configure_component_tracing`]),
/// so the component name travels with each event in both output formats.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .wrap_err_with(|| format!("Invalid log level: {}", config.level))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?,
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?,
    }

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        "kingress logging initialized"
    );
    Ok(())
}

/// Span wrapping everything one long-lived component logs.
pub fn configure_component_tracing(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Request-scoped span; `http.status_code` is recorded once the response is
/// known.
pub fn create_request_span(method: &str, host: &str, path: &str, is_secure: bool) -> tracing::Span {
    tracing::debug_span!(
        "request",
        http.method = method,
        http.host = host,
        http.path = path,
        http.scheme = if is_secure { "https" } else { "http" },
        http.status_code = tracing::field::Empty,
    )
}
