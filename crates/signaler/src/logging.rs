//! Logging configuration for the signaler daemon.
use clap::ValueEnum;
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::filter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

/// Verbosity selectable from the CLI or environment.
#[derive(ValueEnum, Debug, Clone)]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debugging detail, including skipped frames.
    Debug,
    /// Connection lifecycle events.
    Info,
    /// Recoverable problems.
    Warn,
    /// Fatal problems only.
    Error,
}

impl From<LogLevel> for Level {
    fn from(val: LogLevel) -> Self {
        match val {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Record panics as ERROR events so they land in the same stream as the
/// rest of the logs.
pub fn set_panic_hook() {
    std::panic::set_hook(Box::new(|panic| {
        tracing::error!("{panic}");
    }));
}

/// Install the global stderr subscriber.
pub fn init_logging(level: LogLevel) {
    set_panic_hook();

    let level_filter = filter::LevelFilter::from_level(level.into());
    let subscriber = Registry::default().with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(level_filter),
    );

    // Enable log compatible layer to convert log record to tracing span.
    // We will ignore any errors that returned by this functions.
    let _ = LogTracer::init();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
