use futures::future::BoxFuture;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

/// Runs queued futures one at a time, in submission order, each to
/// completion before the next starts.
pub struct SequentialResolver {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    worker: JoinHandle<()>,
}

impl SequentialResolver {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("sequential resolver drained");
        });
        Self { tx, worker }
    }

    pub fn enqueue(&self, job: BoxFuture<'static, ()>) -> bool {
        self.tx.send(job).is_ok()
    }

    pub async fn close(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
#[path = "tests/fifo_tests.rs"]
mod tests;
