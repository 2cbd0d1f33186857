//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events. The binary calls [`init`] once,
//! before anything else runs, to pick console or JSON-lines output.

use std::time::{Duration, Instant};

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Debug level for this crate instead of info
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Filter used when `RUST_LOG` is not set.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "camsync=debug" } else { "camsync=info" }
}

/// Install the process-wide subscriber. Fails if one is already installed.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        // Copy runs are spans; closing them records their duration
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?;
    }

    Ok(())
}

/// Lets a progress message through at most once per interval.
///
/// Owned by a single copy run, so it needs no synchronization.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True for the first call and whenever `interval` has passed since the
    /// last call that returned true.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "camsync=info");
        assert_eq!(default_directive(true), "camsync=debug");
    }

    #[test]
    fn test_log_config_from_app_config() {
        let config = AppConfig {
            json_logs: true,
            ..AppConfig::default()
        };
        let log = LogConfig::from(&config);
        assert!(log.json);
        assert!(!log.verbose);
    }

    #[test]
    fn test_throttle_window() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(throttle.ready_at(t0));
        assert!(!throttle.ready_at(t0 + Duration::from_secs(1)));
        assert!(!throttle.ready_at(t0 + Duration::from_millis(4999)));
        assert!(throttle.ready_at(t0 + Duration::from_secs(5)));
        assert!(!throttle.ready_at(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let mut throttle = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle.ready());
        assert!(throttle.ready());
    }
}
