//! Daemon configuration: flags with `SERVCUR_*` environment fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use servcur_core::{AutoStart, LogRetention, OrchestratorConfig, RetryPolicy};

#[derive(Debug, Clone, Parser)]
#[command(name = "servcurd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "servcur orchestration and log-streaming daemon", long_about = None)]
pub struct DaemonConfig {
    /// Address the gateway listens on
    #[arg(long, env = "SERVCUR_LISTEN", default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Directory for project checkouts, the project store and build archives
    #[arg(long, env = "SERVCUR_DATA_DIR", default_value = "./_data")]
    pub data_dir: PathBuf,

    /// Timeout of a single Docker call, in seconds
    #[arg(long, env = "SERVCUR_DOCKER_TIMEOUT_SECS", default_value_t = 30)]
    pub docker_timeout_secs: u64,

    /// Retries of transient runtime failures
    #[arg(long, env = "SERVCUR_RETRY_MAX", default_value_t = 3)]
    pub retry_max: u32,

    /// First retry delay in milliseconds; doubles per attempt
    #[arg(long, env = "SERVCUR_RETRY_BACKOFF_MS", default_value_t = 250)]
    pub retry_backoff_ms: u64,

    /// Cap on a single retry delay in milliseconds
    #[arg(long, env = "SERVCUR_RETRY_MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub retry_max_backoff_ms: u64,

    /// Bytes of output retained per job stream
    #[arg(long, env = "SERVCUR_LOG_RETENTION_BYTES", default_value_t = 1024 * 1024)]
    pub log_retention_bytes: usize,

    /// Age in seconds after which retained output is evicted
    #[arg(long, env = "SERVCUR_LOG_RETENTION_SECS", default_value_t = 3_600)]
    pub log_retention_secs: u64,

    /// Milliseconds tailing readers wait after a job ends
    #[arg(long, env = "SERVCUR_STREAM_GRACE_MS", default_value_t = 2_000)]
    pub stream_grace_ms: u64,

    /// Seconds a finished job's streams are kept in memory
    #[arg(long, env = "SERVCUR_STREAM_PURGE_SECS", default_value_t = 900)]
    pub stream_purge_secs: u64,

    /// Seconds a stopped job gets to exit before it is killed
    #[arg(long, env = "SERVCUR_STOP_TIMEOUT_SECS", default_value_t = 10)]
    pub stop_timeout_secs: u64,

    /// Start after a successful build: kind, always or never
    #[arg(long, env = "SERVCUR_AUTO_START", default_value = "kind")]
    pub auto_start: AutoStart,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "SERVCUR_LOG_JSON")]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonConfig {
    pub fn docker_timeout(&self) -> Duration {
        Duration::from_secs(self.docker_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max,
            backoff_base_ms: self.retry_backoff_ms,
            max_backoff_ms: self.retry_max_backoff_ms,
        }
    }

    pub fn log_retention(&self) -> LogRetention {
        LogRetention {
            max_bytes: self.log_retention_bytes,
            max_age: Duration::from_secs(self.log_retention_secs),
            grace: Duration::from_millis(self.stream_grace_ms),
            purge_after: Duration::from_secs(self.stream_purge_secs),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry_policy(),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            auto_start: self.auto_start,
        }
    }

    /// How often finished streams are checked for purging.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs((self.stream_purge_secs / 4).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_core_defaults() {
        let cfg = DaemonConfig::try_parse_from(["servcurd"]).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(cfg.data_dir, PathBuf::from("./_data"));
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.log_retention(), LogRetention::default());
        assert_eq!(cfg.orchestrator(), OrchestratorConfig::default());
        assert_eq!(cfg.docker_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.purge_interval(), Duration::from_secs(225));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = DaemonConfig::try_parse_from([
            "servcurd",
            "--listen",
            "0.0.0.0:8080",
            "--auto-start",
            "never",
            "--retry-max",
            "0",
            "--stream-grace-ms",
            "50",
            "--log-json",
        ])
        .unwrap();
        assert_eq!(cfg.listen.port(), 8080);
        assert_eq!(cfg.orchestrator().auto_start, AutoStart::Never);
        assert_eq!(cfg.retry_policy().max_retries, 0);
        assert_eq!(cfg.log_retention().grace, Duration::from_millis(50));
        assert!(cfg.log_json);
    }

    #[test]
    fn unknown_auto_start_is_rejected() {
        assert!(DaemonConfig::try_parse_from(["servcurd", "--auto-start", "maybe"]).is_err());
    }
}
