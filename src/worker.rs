//! Off-thread execution of CPU-bound work (ciphers, hashes, OTP tables).
//!
//! A [ThreadWork] is one unit of work running on tokio's blocking thread pool. Awaiting it yields
//!  the work's result on the calling task. Dropping it before completion detaches the work: the
//!  thread may still run to completion, but its result is discarded and nobody is notified.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::error;

pub struct ThreadWork<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> ThreadWork<T> {
    pub fn spawn<F>(work: F) -> ThreadWork<T>
    where F: FnOnce() -> T + Send + 'static
    {
        ThreadWork {
            handle: tokio::task::spawn_blocking(work),
        }
    }
}

impl<T> Future for ThreadWork<T> {
    /// `None` if the work panicked
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|result| match result {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("thread work failed: {}", e);
                    None
                }
            })
    }
}

impl<T> Drop for ThreadWork<T> {
    fn drop(&mut self) {
        // no effect on work that already started, but the result is not delivered either way
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_is_delivered() {
        let work = ThreadWork::spawn(|| (1..=10).sum::<u32>());
        assert_eq!(work.await, Some(55));
    }

    #[tokio::test]
    async fn test_panic_yields_none() {
        let work = ThreadWork::spawn(|| -> u32 { panic!("boom") });
        assert_eq!(work.await, None);
    }

    #[tokio::test]
    async fn test_dropped_work_is_not_observed() {
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let work = ThreadWork::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            f.store(true, Ordering::Release);
            drop(tx);
        });
        drop(work);

        // the thread still runs, but nothing is delivered through the dropped handle
        let _ = rx.await;
        assert!(finished.load(Ordering::Acquire));
    }
}
