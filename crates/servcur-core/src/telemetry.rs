//! Centralised tracing initialisation for the servcur daemon.
//!
//! Call [`init_tracing`] once at program start. Subsequent calls are
//! ignored (the global subscriber can only be set once per process).

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "SERVCUR_LOG";

/// Filter used when neither `SERVCUR_LOG` nor `RUST_LOG` is set.
pub fn default_directive(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!(
        "servcurd={level},servcur_core={level},servcur_state={level},tower_http=info,bollard=warn"
    )
}

/// Initialise the global tracing subscriber.
///
/// * `json`: emit newline-delimited JSON log lines.
/// * `level`: default verbosity for servcur crates.
///
/// Filter sources in order: `SERVCUR_LOG`, `RUST_LOG`, then
/// [`default_directive`].
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_covers_all_crates() {
        let d = default_directive(Level::DEBUG);
        assert!(d.contains("servcurd=debug"));
        assert!(d.contains("servcur_core=debug"));
        assert!(d.contains("servcur_state=debug"));
        assert!(d.contains("bollard=warn"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing(false, Level::INFO);
        init_tracing(true, Level::DEBUG);
    }
}
