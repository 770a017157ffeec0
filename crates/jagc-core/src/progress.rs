use tokio::sync::broadcast;

use jagc_types::{RunEvent, RunProgressEvent};

/// Fan-out bus for run-scoped progress. Slow subscribers lag and drop, they
/// never block producers.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<RunProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, run_id: &str, event: RunEvent) {
        let _ = self.tx.send(RunProgressEvent {
            run_id: run_id.to_string(),
            event,
        });
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
