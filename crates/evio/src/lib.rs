//! # evio - Event-driven non-blocking I/O
//!
//! Single-threaded async I/O on top of epoll. Sockets, pipes and
//! character devices are driven by readiness; regular files and other
//! blocking calls run on a small worker pool and resume the calling task
//! when they finish.
//!
//! ## Features
//!
//! - **Streams**: parser-driven reads, scatter writes, `TCP_CORK`
//! - **Files**: read/write/seek through the async job bridge
//! - **Zero-copy**: `sendfile` from a file to a stream
//! - **Servers**: `accept`, and `autospawn` for one task per connection
//! - **Sources**: TCP connect/listen, `popen`, stdio
//!
//! ## Quick Start
//!
//! ```ignore
//! use evio::{tcp4_listen, EventLoop, Line, Stream};
//!
//! fn main() -> evio::Result<()> {
//!     let ev = EventLoop::new()?;
//!     ev.block_on(async {
//!         let server = tcp4_listen("*", 7000, 128).await?;
//!         server
//!             .autospawn(|conn: Stream| async move {
//!                 while let Ok(line) = conn.read(Line::new()).await {
//!                     if conn.write(&[&line[..], &b"\n"[..]]).await.is_err() {
//!                         break;
//!                     }
//!                 }
//!             })
//!             .await
//!     })?
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       User tasks                            │
//! │      Stream / File / Server, open, popen, tcp_connect       │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!     would block│                        blocking│syscall
//!                ▼                               ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │   Reactor (epoll)            │   │   Async job bridge       │
//! │   read/write slot per fd     │   │   pool workers → eventfd │
//! └──────────────────────────────┘   └──────────────────────────┘
//!                │                               │
//!                └───────────────┬───────────────┘
//!                                ▼
//!                ┌───────────────────────────────┐
//!                │  Event loop (one per thread)  │
//!                │  ready queue, reap, block_on  │
//!                └───────────────────────────────┘
//! ```

mod waiter;
mod net;

pub mod stream;
pub mod file;
pub mod transfer;
pub mod server;
pub mod tcp;
pub mod popen;
pub mod stdio;

#[cfg(test)]
pub(crate) mod testing;

// Re-export core types
pub use evio_core::{
    EndReason,
    Errno,
    Error,
    Result,
    InputBuffer,
    INPUT_BUFFER_SIZE,
    All,
    Available,
    Line,
    Parse,
    Parser,
    Target,
};

// Re-export kprint macros for debug logging
pub use evio_core::{kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use evio_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use evio_core::{env_get, env_get_bool, env_get_millis, env_get_opt};

// Re-export runtime types
pub use evio_runtime::{
    LoopConfig,
    PoolConfig,
    EventLoop,
    Handle,
    JoinHandle,
    JobFuture,
    JobId,
    Interest,
    execute,
    spawn,
    yield_now,
    async_config,
    execute_detached,
};

pub use file::{open, File, Opened, Whence};
pub use popen::popen;
pub use server::Server;
pub use stdio::{stderr, stdin, stdout};
pub use stream::Stream;
pub use tcp::{tcp4_listen, tcp6_listen, tcp_connect};
