use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use sprig_domain::{Event, Priority};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::subscription::{EventHandler, HandlerError};

/// Result of dispatching one event to one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ok,
    HandlerFailed(String),
    Timeout,
    CircuitOpen,
}

impl DispatchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, DispatchOutcome::Ok)
    }

    /// Failures that dead-letter the event. A timeout does not; the handler
    /// may still complete.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::HandlerFailed(_) | DispatchOutcome::CircuitOpen
        )
    }
}

struct Job {
    priority: Priority,
    seq: u64,
    event: Event,
    handler: Arc<dyn EventHandler>,
    result_tx: oneshot::Sender<DispatchOutcome>,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, lower seq (older) first within a
        // priority band.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Fixed-concurrency worker pool with a priority queue.
///
/// High and Critical jobs jump the queue; equal priority is FIFO. Handler
/// panics are contained per job and surface as `HandlerFailed`.
pub struct DispatchPool {
    queue: Arc<Mutex<BinaryHeap<Job>>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    seq: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    /// Spawn a pool with `concurrency` workers (at least one).
    pub fn new(concurrency: usize) -> Self {
        let queue: Arc<Mutex<BinaryHeap<Job>>> = Arc::new(Mutex::new(BinaryHeap::new()));
        let notify = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let notify = notify.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let job = queue.lock().expect("queue lock poisoned").pop();
                        match job {
                            Some(job) => {
                                debug!(worker, seq = job.seq, priority = %job.priority, "dispatching");
                                let outcome = Self::run(job.event, job.handler).await;
                                let _ = job.result_tx.send(outcome);
                            }
                            None => {
                                if shutdown.load(AtomicOrdering::SeqCst) {
                                    break;
                                }
                                notify.notified().await;
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            queue,
            notify,
            shutdown,
            seq: AtomicU64::new(0),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue one handler invocation; the receiver resolves with its
    /// outcome.
    pub fn submit(
        &self,
        event: Event,
        handler: Arc<dyn EventHandler>,
        priority: Priority,
    ) -> oneshot::Receiver<DispatchOutcome> {
        let (result_tx, result_rx) = oneshot::channel();
        let job = Job {
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            event,
            handler,
            result_tx,
        };
        self.queue.lock().expect("queue lock poisoned").push(job);
        self.notify.notify_one();
        result_rx
    }

    /// Run one handler in its own task so a panic is contained to the job.
    async fn run(event: Event, handler: Arc<dyn EventHandler>) -> DispatchOutcome {
        let joined = tokio::spawn(async move { handler.handle(&event).await }).await;
        match joined {
            Ok(Ok(())) => DispatchOutcome::Ok,
            Ok(Err(HandlerError::CircuitOpen(_))) => DispatchOutcome::CircuitOpen,
            Ok(Err(HandlerError::Failed(message))) => DispatchOutcome::HandlerFailed(message),
            Err(join_error) => {
                DispatchOutcome::HandlerFailed(format!("handler panicked: {}", join_error))
            }
        }
    }

    /// Stop the workers. Queued jobs that never ran resolve as dropped
    /// receivers on the caller side.
    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
        for worker in self.workers.lock().expect("worker lock poisoned").drain(..) {
            worker.abort();
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
