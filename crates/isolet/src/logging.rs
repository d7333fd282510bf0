//! Tracing setup shared by the controller and the worker binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset. `ISOLET_LOG` picks the base level.
fn default_filter() -> EnvFilter {
    let base_level = match std::env::var("ISOLET_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!(
        "isolet={level},isolet_worker={level},isolet::bridge::codec=off",
        level = base_level
    ))
}

/// Installs a stderr subscriber. `LOG_FORMAT=json` switches to JSON lines.
///
/// Safe to call more than once; later calls are ignored. Always writes to stderr since a
/// worker's stdout carries the control channel.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        default_filter()
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
