//! # Delivery context
//!
//! All user-visible callbacks (results, progress, cached responses) are marshaled
//! onto one sequential queue so observers see them in order and never run on a
//! network or I/O worker. By default the queue is drained by a spawned Tokio task;
//! an embedding application can instead drain a [`DeliveryQueue`] from its own
//! main loop.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle used to post callbacks onto the delivery context.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving end of the delivery context.
pub struct DeliveryQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Dispatcher {
    /// Create a dispatcher and the queue that must be drained for callbacks to run.
    pub fn channel() -> (Self, DeliveryQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DeliveryQueue { rx })
    }

    /// Create a dispatcher drained by a background task on the current runtime.
    pub fn spawn() -> Self {
        let (dispatcher, queue) = Self::channel();
        tokio::spawn(queue.run());
        dispatcher
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("Delivery context is closed, dropping callback");
        }
    }

    /// Resolve once every callback posted before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl DeliveryQueue {
    /// Run callbacks until every [`Dispatcher`] has been dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            run_job(job);
        }
    }

    /// Run whatever is queued right now without waiting. Returns the number of callbacks run.
    pub fn drain(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Delivery callback panicked");
    }
}
