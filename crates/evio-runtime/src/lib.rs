//! # evio-runtime
//!
//! Single-threaded event loop for evio.
//!
//! This crate provides:
//! - Epoll reactor with per-descriptor read/write waiter slots
//! - Eventfd wake source for cross-thread wakeups
//! - Executor for `!Send` tasks (`spawn`, `block_on`, `run`, `yield_now`)
//! - Async job bridge: a bounded worker pool for blocking work, with
//!   results reaped back on the loop thread
//! - Loop and pool configuration

pub mod config;
pub mod sys;
pub mod notifier;
pub mod pool;
pub mod job;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod reactor;
        pub mod event_loop;
    } else {
        compile_error!("evio-runtime requires epoll and eventfd (Linux)");
    }
}

// Re-exports
pub use config::{LoopConfig, PoolConfig};
pub use event_loop::{execute, spawn, yield_now, EventLoop, Handle, JoinHandle, YieldNow};
pub use job::{JobFuture, JobId};
pub use notifier::{EventFdNotifier, Notifier};
pub use pool::{async_config, execute_detached, AsyncPool, PoolStats};
pub use reactor::{Interest, Readiness, Reactor};
