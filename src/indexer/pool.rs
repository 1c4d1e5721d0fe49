//! Bounded parallel embedding worker pool.
//!
//! A fixed number of OS threads consume tasks from an unbounded channel and
//! complete them through per-task reply channels. The pool does no
//! sub-batching of its own; oversized inputs are the provider's problem.
//! The one invariant enforced here: a batch response must contain exactly
//! one vector per input, otherwise the task fails with
//! `PartialEmbeddingResponse` and the indexing run aborts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::embed::{EmbeddingProvider, ThrottleState};
use crate::error::{CidxError, Result};

struct Task {
    texts: Vec<String>,
    reply: SyncSender<Result<Vec<Vec<f32>>>>,
}

/// Handle to one submitted embedding task.
pub struct PendingEmbedding {
    receiver: Receiver<Result<Vec<Vec<f32>>>>,
}

impl PendingEmbedding {
    /// Block until the worker completes the task.
    pub fn wait(self) -> Result<Vec<Vec<f32>>> {
        self.receiver
            .recv()
            .map_err(|_| CidxError::IndexingFailure("embedding worker exited".to_string()))?
    }
}

pub struct EmbeddingPool {
    provider: Arc<dyn EmbeddingProvider>,
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    submitted: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
}

impl EmbeddingPool {
    /// Spawn `worker_count` threads sharing the provider.
    pub fn start(provider: Arc<dyn EmbeddingProvider>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1).min(num_cpus::get().max(1) * 4);
        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(std::sync::Mutex::new(receiver));

        let submitted = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let provider = Arc::clone(&provider);
            let completed = Arc::clone(&completed);

            workers.push(std::thread::spawn(move || loop {
                let task = {
                    let guard = receiver.lock().expect("task queue poisoned");
                    guard.recv()
                };
                let Ok(task) = task else {
                    debug!("embedding worker {worker_id} shutting down");
                    break;
                };

                let requested = task.texts.len();
                let result = provider.get_embeddings_batch(&task.texts).and_then(|vectors| {
                    if vectors.len() == requested {
                        Ok(vectors)
                    } else {
                        Err(CidxError::PartialEmbeddingResponse {
                            requested,
                            returned: vectors.len(),
                        })
                    }
                });

                completed.fetch_add(1, Ordering::Relaxed);
                if task.reply.send(result).is_err() {
                    warn!("embedding result dropped: submitter no longer waiting");
                }
            }));
        }

        debug!("embedding pool started with {worker_count} workers");
        Self {
            provider,
            sender: Some(sender),
            workers,
            submitted,
            completed,
        }
    }

    /// Submit one batch of chunk texts; returns a handle to wait on.
    pub fn submit(&self, texts: Vec<String>) -> Result<PendingEmbedding> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CidxError::IndexingFailure("embedding pool shut down".to_string()))?;

        let (reply, receiver) = std::sync::mpsc::sync_channel(1);
        sender
            .send(Task { texts, reply })
            .map_err(|_| CidxError::IndexingFailure("embedding pool shut down".to_string()))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);

        Ok(PendingEmbedding { receiver })
    }

    /// Convenience wrapper for a single chunk.
    pub fn submit_chunk(&self, text: String) -> Result<PendingEmbedding> {
        self.submit(vec![text])
    }

    /// Current provider throttle posture, for progress reporting.
    pub fn throttle_state(&self) -> ThrottleState {
        self.provider.throttle_state()
    }

    pub fn tasks_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn tasks_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Stop accepting work and join all workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for EmbeddingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
