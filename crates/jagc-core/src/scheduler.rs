//! Process-wide run scheduler: FIFO per thread key, parallel across thread
//! keys. At most one dispatch is in flight per thread at any instant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

#[async_trait]
pub trait RunDispatcher: Send + Sync {
    /// Drive the run to a terminal state. Must not panic; errors are the
    /// dispatcher's to record.
    async fn dispatch_run_by_id(&self, run_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    AlreadyQueued,
    Rejected,
}

struct SchedState {
    queues: HashMap<String, VecDeque<String>>,
    busy: HashSet<String>,
    /// Run ids queued or currently dispatching, for `ensure_enqueued`.
    tracked: HashSet<String>,
    accepting: bool,
}

struct Inner {
    state: Mutex<SchedState>,
    idle: Notify,
    dispatcher: OnceLock<Arc<dyn RunDispatcher>>,
}

#[derive(Clone)]
pub struct LocalRunScheduler {
    inner: Arc<Inner>,
}

impl LocalRunScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedState {
                    queues: HashMap::new(),
                    busy: HashSet::new(),
                    tracked: HashSet::new(),
                    accepting: true,
                }),
                idle: Notify::new(),
                dispatcher: OnceLock::new(),
            }),
        }
    }

    /// Wire the dispatch target once at assembly time.
    pub fn bind_dispatcher(&self, dispatcher: Arc<dyn RunDispatcher>) {
        if self.inner.dispatcher.set(dispatcher).is_err() {
            error!("scheduler dispatcher bound twice; keeping the first");
        }
    }

    pub async fn enqueue(&self, thread_key: &str, run_id: &str) -> EnqueueOutcome {
        let mut state = self.inner.state.lock().await;
        if !state.accepting {
            return EnqueueOutcome::Rejected;
        }
        state.tracked.insert(run_id.to_string());
        state
            .queues
            .entry(thread_key.to_string())
            .or_default()
            .push_back(run_id.to_string());
        if state.busy.insert(thread_key.to_string()) {
            self.spawn_worker(thread_key.to_string());
        }
        EnqueueOutcome::Enqueued
    }

    /// Idempotent variant: a run already queued or in flight is left alone.
    /// Crash recovery uses this to avoid double-dispatching.
    pub async fn ensure_enqueued(&self, thread_key: &str, run_id: &str) -> EnqueueOutcome {
        {
            let state = self.inner.state.lock().await;
            if state.tracked.contains(run_id) {
                return EnqueueOutcome::AlreadyQueued;
            }
        }
        self.enqueue(thread_key, run_id).await
    }

    /// Stop accepting work and wait for every in-flight dispatch to settle.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.accepting = false;
        }
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.state.lock().await;
                if state.busy.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn queued_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.tracked.len()
    }

    fn spawn_worker(&self, thread_key: String) {
        debug!(thread_key, "scheduler worker spawned");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut state = inner.state.lock().await;
                    let popped = if state.accepting {
                        state.queues.get_mut(&thread_key).and_then(|q| q.pop_front())
                    } else {
                        // Shutdown: finish nothing new. Queued runs stay
                        // `running` in the store and are recovered at boot.
                        None
                    };
                    match popped {
                        Some(run_id) => Some(run_id),
                        None => {
                            state.queues.remove(&thread_key);
                            state.busy.remove(&thread_key);
                            inner.idle.notify_waiters();
                            None
                        }
                    }
                };
                let Some(run_id) = next else {
                    return;
                };

                match inner.dispatcher.get() {
                    Some(dispatcher) => dispatcher.dispatch_run_by_id(&run_id).await,
                    None => error!(run_id, "no dispatcher bound; dropping run"),
                }

                let mut state = inner.state.lock().await;
                state.tracked.remove(&run_id);
            }
        });
    }
}

impl Default for LocalRunScheduler {
    fn default() -> Self {
        Self::new()
    }
}
