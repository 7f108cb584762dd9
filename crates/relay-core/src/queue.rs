use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{domain::Request, errors::Error, Result};

/// Create a bounded FIFO work queue with a fixed capacity.
pub fn work_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (QueueSender { tx, capacity }, QueueReceiver { rx })
}

/// Producer handle. Cheap to clone; one per ingress handler is fine.
#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<Request>,
    capacity: usize,
}

impl QueueSender {
    /// Admit a request without blocking. Rejects with `QueueFull` at capacity.
    pub fn enqueue(&self, request: Request) -> Result<()> {
        match self.tx.try_send(request) {
            Ok(()) => {
                tracing::debug!(pending = self.len(), "request enqueued");
                Ok(())
            }
            Err(TrySendError::Full(req)) => {
                tracing::warn!(
                    user_id = req.requester.0,
                    capacity = self.capacity,
                    "queue full, rejecting request"
                );
                Err(Error::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(Error::External("dispatcher stopped".to_string())),
        }
    }

    /// Requests waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer handle, owned by the dispatcher.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Request>,
}

impl QueueReceiver {
    /// Wait for the next request. `None` once every sender is gone.
    pub async fn dequeue(&mut self) -> Option<Request> {
        self.rx.recv().await
    }
}
