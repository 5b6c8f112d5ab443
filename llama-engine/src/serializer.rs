// llama-engine/src/serializer.rs
//
// Single worker thread that runs every native-touching job in submission order.

use std::sync::{mpsc as std_mpsc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, Result};
use crate::guard::ResourceGuard;

type Job = Box<dyn FnOnce(&mut ResourceGuard) + Send + 'static>;

const WORKER_THREAD_NAME: &str = "llama-engine-worker";

/// Execution serializer.
///
/// The [`ResourceGuard`] is built on the worker thread and never leaves it.
/// Jobs are queued on an unbounded channel and executed one at a time; a job
/// runs to completion before the next one starts.
pub(crate) struct Serializer {
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Serializer {
    /// Spawn the worker and run `init` on it, blocking until it finishes.
    pub(crate) fn start<F>(init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<ResourceGuard> + Send + 'static,
    {
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Job>();
        // std channel: callers may be inside a runtime, where tokio's blocking_recv panics.
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<()>>(1);

        let worker = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut guard = match init() {
                    Ok(guard) => {
                        let _ = ready_tx.send(Ok(()));
                        guard
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some(job) = queue_rx.blocking_recv() {
                    job(&mut guard);
                }
                log::debug!("Execution serializer queue closed, worker exiting");
            })
            .map_err(|e| EngineError::Serializer(format!("failed to spawn worker: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue: Mutex::new(Some(queue_tx)),
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(EngineError::Serializer(
                    "worker exited during initialization".to_string(),
                ))
            }
        }
    }

    fn queue(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Job>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job without waiting for it.
    pub(crate) fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut ResourceGuard) + Send + 'static,
    {
        let queue = self.queue();
        let sender = queue.as_ref().ok_or(EngineError::Destroyed)?;
        sender
            .send(Box::new(job))
            .map_err(|_| EngineError::Serializer("worker is not running".to_string()))
    }

    /// Queue a job and wait for its result.
    pub(crate) async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut ResourceGuard) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(move |guard| {
            let _ = tx.send(job(guard));
        })?;
        rx.await
            .map_err(|_| EngineError::Serializer("job dropped before completion".to_string()))?
    }

    /// Queue a final job and close the queue behind it.
    ///
    /// Returns `None` when the queue was already closed.
    pub(crate) fn close_with<T, F>(&self, job: F) -> Option<oneshot::Receiver<T>>
    where
        F: FnOnce(&mut ResourceGuard) -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.queue().take()?;
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |guard| {
            let _ = tx.send(job(guard));
        });
        // A failed send drops the job, which the receiver observes as a closed channel.
        let _ = sender.send(job);
        Some(rx)
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
