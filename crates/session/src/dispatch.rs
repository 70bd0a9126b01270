//! Bounded hand-off between a session and its observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kwatch_core::{Observer, WatchEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) struct Dispatcher {
    tx: mpsc::Sender<WatchEvent>,
    task: JoinHandle<()>,
    delivered: Arc<AtomicU64>,
}

/// What happened to the queue when the session closed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Drained {
    pub delivered: u64,
    pub complete: bool,
}

/// Spawn the task that feeds `observer` from a queue of `cap` events.
pub(crate) fn spawn(observer: Arc<dyn Observer>, cap: usize) -> Dispatcher {
    let (tx, mut rx) = mpsc::channel::<WatchEvent>(cap.max(1));
    let delivered = Arc::new(AtomicU64::new(0));
    let count = Arc::clone(&delivered);
    let task = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            observer.on_event(&ev);
            count.fetch_add(1, Ordering::Relaxed);
        }
    });
    Dispatcher { tx, task, delivered }
}

impl Dispatcher {
    pub(crate) fn sender(&self) -> &mpsc::Sender<WatchEvent> {
        &self.tx
    }

    /// Close the queue and give the observer `grace` to catch up; abort after that.
    pub(crate) async fn close(self, grace: Duration) -> Drained {
        let Dispatcher { tx, mut task, delivered } = self;
        drop(tx);
        let complete = match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "observer task failed");
                false
            }
            Err(_) => {
                warn!(grace_ms = %grace.as_millis(), "observer queue not drained in time; aborting");
                task.abort();
                false
            }
        };
        let delivered = delivered.load(Ordering::Relaxed);
        debug!(delivered, complete, "observer queue closed");
        Drained { delivered, complete }
    }
}
