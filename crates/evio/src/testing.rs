//! Shared fixtures for unit tests

use evio_runtime::{EventLoop, LoopConfig, PoolConfig};

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// A loop with a private pool, current on the calling thread.
pub(crate) fn test_loop() -> EventLoop {
    let config = LoopConfig::new().pool(PoolConfig::new().max_workers(4));
    EventLoop::with_config(config).unwrap()
}

/// A fresh path under the temp dir, unique per process and call.
pub(crate) fn temp_path(name: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("evio-{}-{}-{}", name, std::process::id(), n))
}

struct Ignore;

impl Wake for Ignore {
    fn wake(self: Arc<Self>) {}
}

/// Poll `fut` once outside any task, so a test can drop it mid-flight.
pub(crate) fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let waker = Waker::from(Arc::new(Ignore));
    fut.poll(&mut Context::from_waker(&waker))
}
