//! The bounded worker pool between the HTTP handlers and the engine.
//!
//! Each worker owns one queue and serializes the jobs routed to it; the
//! producer side walks the queues round-robin. Back-pressure comes from the
//! queues themselves: once every worker is busy, submitters wait.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::{
    engine::Processor,
    error::Error,
    img::{Image, TransformationConfig},
};

/// A unit of work routed through the pool.
#[derive(Debug)]
pub enum Payload {
    /// Run the configured transformation on a worker.
    Transform(TransformationConfig),

    /// Pass-through: the result is known up front. It still rides a queue so
    /// pass-through requests share the pool's admission control.
    Ready(Image),
}

struct Command {
    payload: Payload,
    reply: oneshot::Sender<Result<Image, Error>>,
}

/// A fixed set of workers, each serving its own queue.
pub struct WorkerPool {
    queues: Vec<mpsc::Sender<Command>>,
    next: Mutex<usize>,
}

impl WorkerPool {
    /// Spawns `workers` long-lived worker tasks sharing the processor.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`Error::PoolMisconfigured`] when `workers` is zero.
    pub fn new<P>(processor: Arc<P>, workers: usize) -> Result<Self, Error>
    where
        P: Processor + 'static,
    {
        if workers == 0 {
            return Err(Error::PoolMisconfigured);
        }

        tracing::info!(workers, "creating worker pool");

        let queues = (0..workers)
            .map(|_| {
                let (queue, mut jobs) = mpsc::channel::<Command>(1);
                let processor = Arc::clone(&processor);

                tokio::spawn(async move {
                    while let Some(Command { payload, reply }) = jobs.recv().await {
                        let result = match payload {
                            Payload::Ready(image) => Ok(image),
                            Payload::Transform(config) => processor.apply(config).await,
                        };

                        // The submitter may have abandoned the wait; the
                        // result is dropped then.
                        let _ = reply.send(result);
                    }
                });

                queue
            })
            .collect();

        Ok(Self {
            queues,
            next: Mutex::new(0),
        })
    }

    /// Submits a payload on the next queue and waits for its worker to
    /// finish it.
    ///
    /// Blocks while the chosen worker is busy; two submissions routed to the
    /// same queue complete in arrival order.
    pub async fn submit(&self, payload: Payload) -> Result<Image, Error> {
        let (reply, done) = oneshot::channel();

        let queue = {
            let mut next = self.next.lock().expect("round-robin index poisoned");
            *next = (*next + 1) % self.queues.len();
            &self.queues[*next]
        };

        queue
            .send(Command { payload, reply })
            .await
            .map_err(|_| Error::WorkerLost)?;

        done.await.map_err(|_| Error::WorkerLost)?
    }

    /// The number of workers the pool was created with.
    pub fn workers(&self) -> usize {
        self.queues.len()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.queues.len())
            .finish()
    }
}
