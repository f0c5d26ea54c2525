//! Event loop and worker pool configuration

use evio_core::env::{env_get, env_get_bool, env_get_millis};
use std::time::Duration;

/// Upper bound on async worker threads
pub const MAX_POOL_WORKERS: usize = 256;

/// Configuration for the async worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long a worker above `min_workers` may sit idle before exiting
    pub linger: Duration,

    /// Workers that never retire once started
    pub min_workers: usize,

    /// Workers are spawned lazily up to this bound
    pub max_workers: usize,

    /// Thread name prefix; workers are named `<prefix>-<n>`
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(10),
            min_workers: 0,
            max_workers: 8,
            thread_name: "evio-async".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EVIO_POOL_LINGER_MS`, `EVIO_POOL_MIN` and
    /// `EVIO_POOL_MAX`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            linger: env_get_millis("EVIO_POOL_LINGER_MS", d.linger),
            min_workers: env_get("EVIO_POOL_MIN", d.min_workers),
            max_workers: env_get("EVIO_POOL_MAX", d.max_workers),
            thread_name: d.thread_name,
        }
    }

    pub fn linger(mut self, d: Duration) -> Self {
        self.linger = d;
        self
    }

    pub fn min_workers(mut self, n: usize) -> Self {
        self.min_workers = n;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1");
        }
        if self.max_workers > MAX_POOL_WORKERS {
            return Err("max_workers exceeds maximum");
        }
        if self.min_workers > self.max_workers {
            return Err("min_workers must not exceed max_workers");
        }
        Ok(())
    }
}

/// Configuration for an event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Readiness events fetched per `epoll_wait`
    pub max_events: usize,

    /// Ignore `SIGPIPE` process-wide so writes to a closed peer fail with
    /// `EPIPE` instead of killing the process
    pub ignore_sigpipe: bool,

    /// Private worker pool for this loop; `None` shares the process-wide
    /// pool
    pub pool: Option<PoolConfig>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_events: 256,
            ignore_sigpipe: true,
            pool: None,
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EVIO_MAX_EVENTS` and `EVIO_IGNORE_SIGPIPE`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_events: env_get("EVIO_MAX_EVENTS", d.max_events),
            ignore_sigpipe: env_get_bool("EVIO_IGNORE_SIGPIPE", d.ignore_sigpipe),
            pool: None,
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn ignore_sigpipe(mut self, enable: bool) -> Self {
        self.ignore_sigpipe = enable;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_events == 0 {
            return Err("max_events must be at least 1");
        }
        if self.max_events > i32::MAX as usize {
            return Err("max_events exceeds maximum");
        }
        match &self.pool {
            Some(pool) => pool.validate(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(LoopConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pool_validation() {
        assert!(PoolConfig::new().max_workers(0).validate().is_err());
        assert!(PoolConfig::new().max_workers(MAX_POOL_WORKERS + 1).validate().is_err());
        assert_eq!(
            PoolConfig::new().min_workers(4).max_workers(2).validate(),
            Err("min_workers must not exceed max_workers")
        );
        let cfg = PoolConfig::new()
            .linger(Duration::from_millis(50))
            .min_workers(1)
            .max_workers(3)
            .thread_name("io");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.thread_name, "io");
    }

    #[test]
    fn test_loop_validation_includes_pool() {
        assert!(LoopConfig::new().max_events(0).validate().is_err());
        let bad = LoopConfig::new().pool(PoolConfig::new().max_workers(0));
        assert_eq!(bad.validate(), Err("max_workers must be at least 1"));
    }

    #[test]
    fn test_pool_from_env() {
        std::env::set_var("EVIO_POOL_LINGER_MS", "250");
        std::env::set_var("EVIO_POOL_MAX", "3");
        let cfg = PoolConfig::from_env();
        std::env::remove_var("EVIO_POOL_LINGER_MS");
        std::env::remove_var("EVIO_POOL_MAX");
        assert_eq!(cfg.linger, Duration::from_millis(250));
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.min_workers, PoolConfig::default().min_workers);
    }
}
