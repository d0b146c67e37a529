use crate::infrastructure::queue::{Disposition, QueueError, TaskQueue};
use crate::workers::dispatcher::Dispatcher;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SUBSCRIBE_RETRY: Duration = Duration::from_secs(5);

/// A fixed number of consumers, each encoding one delivery at a time.
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    size: usize,
    requeue_delay: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn TaskQueue>, dispatcher: Arc<Dispatcher>, size: usize) -> Self {
        Self {
            queue,
            dispatcher,
            size: size.max(1),
            requeue_delay: Duration::from_secs(2),
        }
    }

    /// Pause before handing a transiently failed message back to the broker.
    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("🎥 Starting {} transcoder worker(s)", self.size);

        (0..self.size)
            .map(|slot| {
                let consumer = Consumer {
                    tag: format!("transcoder_worker_{}", slot),
                    queue: self.queue.clone(),
                    dispatcher: self.dispatcher.clone(),
                    requeue_delay: self.requeue_delay,
                };
                tokio::spawn(consumer.run(shutdown.clone()))
            })
            .collect()
    }
}

struct Consumer {
    tag: String,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    requeue_delay: Duration,
}

impl Consumer {
    async fn run(self, shutdown: CancellationToken) {
        loop {
            let mut deliveries = match self.queue.subscribe(&self.tag).await {
                Ok(stream) => stream,
                Err(QueueError::Closed) => break,
                Err(e) => {
                    error!("❌ [{}] Failed to subscribe: {}", self.tag, e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(SUBSCRIBE_RETRY) => continue,
                    }
                }
            };
            info!("🎥 [{}] Listening for tasks", self.tag);

            loop {
                // Shutdown is only observed between deliveries; an encode in
                // flight runs to completion.
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("[{}] Shutdown requested", self.tag);
                        return;
                    }
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        if delivery.redelivered {
                            info!("[{}] Received redelivered task", self.tag);
                        }
                        let disposition = self.dispatcher.dispatch(&delivery.body).await;
                        if disposition == Disposition::Requeue {
                            tokio::time::sleep(self.requeue_delay).await;
                        }
                        if let Err(e) = delivery.settle(disposition).await {
                            error!("❌ [{}] Failed to settle delivery: {}", self.tag, e);
                        }
                    }
                    Some(Err(QueueError::Closed)) | None => {
                        warn!("[{}] Task stream ended", self.tag);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("❌ [{}] Delivery error: {}", self.tag, e);
                        break;
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }
            // Resubscribing to a closed in-memory queue ends the loop above.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("[{}] Worker stopped", self.tag);
    }
}
