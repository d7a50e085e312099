use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{DurableProducerQueue, DurableState, MessageSent};
use crate::errors::DurableQueueError;
use crate::types::{ConfirmationQualifier, Payload, SeqNr, Timestamp};

/// In-memory durable queue.
///
/// Clones share the same state, so a clone handed to a restarted controller
/// sees everything its predecessor wrote.
pub struct InMemoryDurableProducerQueue<T> {
    state: Arc<RwLock<DurableState<T>>>,
    failing_writes: Arc<AtomicU32>,
}

impl<T> Clone for InMemoryDurableProducerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failing_writes: Arc::clone(&self.failing_writes),
        }
    }
}

impl<T> Default for InMemoryDurableProducerQueue<T> {
    fn default() -> Self {
        Self::with_state(DurableState::default())
    }
}

impl<T> InMemoryDurableProducerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted state.
    pub fn with_state(state: DurableState<T>) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            failing_writes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` `store_message_sent` calls fail as unavailable.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<T: Clone> InMemoryDurableProducerQueue<T> {
    /// Copy of the current state.
    pub async fn snapshot(&self) -> DurableState<T> {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl<T: Payload> DurableProducerQueue<T> for InMemoryDurableProducerQueue<T> {
    async fn load_state(&self) -> Result<DurableState<T>, DurableQueueError> {
        Ok(self.state.read().await.clone())
    }

    async fn store_message_sent(&self, sent: MessageSent<T>) -> Result<(), DurableQueueError> {
        if self.take_injected_failure() {
            return Err(DurableQueueError::unavailable("injected write failure"));
        }
        let seq_nr = sent.seq_nr;
        self.state.write().await.add_message_sent(sent)?;
        debug!(seq_nr, "Stored MessageSent");
        Ok(())
    }

    async fn store_message_confirmed(
        &self,
        seq_nr: SeqNr,
        qualifier: ConfirmationQualifier,
        timestamp: Timestamp,
    ) -> Result<(), DurableQueueError> {
        self.state
            .write()
            .await
            .add_confirmed(seq_nr, &qualifier, timestamp);
        Ok(())
    }

    async fn cleanup(
        &self,
        qualifiers: HashSet<ConfirmationQualifier>,
    ) -> Result<(), DurableQueueError> {
        self.state.write().await.cleanup(&qualifiers);
        Ok(())
    }
}
