//! Buffered status writes: terminal status/output for successfully
//! completed workflows are buffered in memory and flushed in batches on a
//! timer and on shutdown. Critical writes (input recording, step outputs,
//! error transitions, recovery attempts) are never buffered here; they
//! commit synchronously through `SystemDatabase` directly.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::persistence::SystemDatabase;

#[derive(Default)]
struct BufferState {
    pending: HashMap<Uuid, Option<String>>,
}

/// In-memory batch of pending terminal-status writes.
pub struct StatusWriteBuffer {
    state: Mutex<BufferState>,
}

impl StatusWriteBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn buffer(&self, workflow_uuid: Uuid, output: Option<String>) {
        self.state.lock().pending.insert(workflow_uuid, output);
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every buffered entry to the given store, draining the buffer
    /// regardless of individual failures (logged and retried on the next
    /// flush cycle by re-buffering).
    #[instrument(skip(self, store))]
    pub async fn flush(&self, store: &dyn SystemDatabase) {
        let pending: Vec<(Uuid, Option<String>)> = {
            let mut state = self.state.lock();
            state.pending.drain().collect()
        };
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "flushing buffered workflow statuses");
        for (workflow_uuid, output) in pending {
            if let Err(e) = store.buffer_workflow_status(workflow_uuid, output.clone()).await {
                warn!(%workflow_uuid, error = %e, "failed to flush buffered status, re-buffering");
                self.buffer(workflow_uuid, output);
            }
        }
    }

    /// Spawn the periodic flush task; the returned handle should be
    /// aborted (after one last manual `flush`) during graceful shutdown.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        store: Arc<dyn SystemDatabase>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    buffer.flush(store.as_ref()).await;
                }
            })
    }
}

impl Default for StatusWriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemorySystemDatabase;

    #[tokio::test]
    async fn buffered_entries_are_flushed() {
        let store = InMemorySystemDatabase::new();
        let identity = crate::persistence::Identity::default();
        let uuid = Uuid::new_v4();
        store
        .init_workflow_status(uuid, "wf", None, None, &identity, None, "local", None, "[]")
        .await
        .unwrap();

        let buffer = StatusWriteBuffer::new();
        buffer.buffer(uuid, Some("\"done\"".to_string()));
        assert_eq!(buffer.len(), 1);

        buffer.flush(&store).await;
        assert!(buffer.is_empty());

        let status = store.get_workflow_status(uuid).await.unwrap();
        assert_eq!(status.status, crate::persistence::WorkflowStatusValue::Success);
    }
}
