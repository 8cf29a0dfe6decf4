use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "mailtrix=info,tower_http=info";

/// Sets up the global tracing subscriber.
///
/// Environment:
///   LOG_FORMAT - "text" (default) or "json"
///   LOG_FILE   - write to a daily-rotated file instead of stderr
///   RUST_LOG   - standard env filter
///
/// With `console` false and no LOG_FILE nothing is installed, which keeps the
/// terminal dashboard clean. Hold on to the returned guard until exit so the
/// file writer flushes.
pub fn init(console: bool) -> Option<WorkerGuard> {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");
    let log_file = std::env::var("LOG_FILE").ok().filter(|p| !p.trim().is_empty());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(path) = log_file {
        let path = Path::new(&path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("mailtrix.log");
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if json {
            registry.with(fmt::layer().json().with_writer(writer)).init();
        } else {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
        }
        return Some(guard);
    }

    if !console {
        return None;
    }

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
    None
}
