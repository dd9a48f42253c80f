//! Utilities for logging.

use tracing::Level;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable that may be used to override the default filter.
pub const LOG_FILTER_ENV: &str = "NATIVESRV_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

/// Configure the global logger, writing formatted logs to `writer`.
///
/// Errors setting the global default are ignored so that tests and binaries
/// may call this more than once.
pub fn configure_global_logger<W>(default_level: Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let _ = try_configure_global_logger(default_level, format, writer, None::<NoopLayer>);
}

/// Same as [`configure_global_logger`], but additionally composes `extra` into
/// the subscriber.
///
/// The extra layer sees every event regardless of the formatting filter. This
/// lets per-query log capture observe events at levels the process log would
/// otherwise drop.
pub fn configure_global_logger_with_layer<W, L>(
    default_level: Level,
    format: LogFormat,
    writer: W,
    extra: L,
) where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    L: Layer<Registry> + Send + Sync + 'static,
{
    let _ = try_configure_global_logger(default_level, format, writer, Some(extra));
}

fn try_configure_global_logger<W, L>(
    default_level: Level,
    format: LogFormat,
    writer: W,
    extra: Option<L>,
) -> Result<(), SetGlobalDefaultError>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    L: Layer<Registry> + Send + Sync + 'static,
{
    let filter = env_filter(default_level);

    let fmt_layer = match format {
        LogFormat::HumanReadable => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
    };

    // Extra layer goes first so it's composed directly over the registry.
    let subscriber = Registry::default().with(extra).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_ascii_lowercase()))
}

/// Layer that does nothing, used when no extra layer is provided.
struct NoopLayer;

impl<S> Layer<S> for NoopLayer where S: tracing::Subscriber + for<'a> LookupSpan<'a> {}
