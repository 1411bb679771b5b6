//! Waitable handles for asynchronous device operations.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use super::DeviceError;

/// Reports fractional progress (0.0 - 1.0) of a running device operation.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<f64>>,
}

impl ProgressReporter {
    pub fn set(&self, fraction: f64) {
        self.tx.send_replace(fraction.clamp(0.0, 1.0));
    }
}

/// Handle to a device operation running in the background.
///
/// Supports progress polling, bounded waiting and cancellation.
#[derive(Debug)]
pub struct DeviceFuture<T> {
    device: String,
    handle: JoinHandle<Result<T, DeviceError>>,
    progress: watch::Receiver<f64>,
}

/// A pending move.
pub type MoveFuture = DeviceFuture<()>;

impl<T: Send + 'static> DeviceFuture<T> {
    /// Run `operation` on the tokio runtime.
    pub fn spawn<F, Fut>(device: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>> + Send + 'static,
    {
        let (tx, progress) = watch::channel(0.0);
        let reporter = ProgressReporter { tx: Arc::new(tx) };
        let done = reporter.clone();
        let fut = operation(reporter);
        let handle = tokio::spawn(async move {
            let result = fut.await;
            if result.is_ok() {
                done.set(1.0);
            }
            result
        });

        Self {
            device: device.into(),
            handle,
            progress,
        }
    }

    /// An operation that has already finished with `result`.
    pub fn ready(device: impl Into<String>, result: Result<T, DeviceError>) -> Self {
        Self::spawn(device, move |_| async move { result })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Last reported progress fraction.
    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request cancellation; waiting afterwards yields `DeviceError::Cancelled`.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the operation to finish.
    pub async fn wait(self) -> Result<T, DeviceError> {
        let device = self.device;
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DeviceError::Cancelled { device }),
            Err(e) => Err(DeviceError::Task {
                device,
                reason: e.to_string(),
            }),
        }
    }

    /// Wait at most `limit`; the operation is cancelled on expiry.
    pub async fn wait_timeout(self, limit: Duration) -> Result<T, DeviceError> {
        let device = self.device.clone();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                abort.abort();
                Err(DeviceError::Timeout {
                    device,
                    after: limit,
                })
            }
        }
    }
}

/// Shared cancellation flag for long-running operations.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
