//! Durable producer queue contract.
//!
//! A producer with a durable queue writes every message before sending it and
//! records confirmations as they arrive, so a restarted controller can replay
//! whatever was never confirmed.

mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::DurableQueueError;
use crate::types::{ConfirmationQualifier, Payload, SeqNr, Timestamp};

pub use memory::InMemoryDurableProducerQueue;

/// Write-ahead record of a message handed to the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSent<T> {
    pub seq_nr: SeqNr,
    pub message: T,
    pub ack: bool,
    pub confirmation_qualifier: ConfirmationQualifier,
    pub timestamp: Timestamp,
}

impl<T> MessageSent<T> {
    pub fn new(
        seq_nr: SeqNr,
        message: T,
        ack: bool,
        confirmation_qualifier: impl Into<ConfirmationQualifier>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            seq_nr,
            message,
            ack,
            confirmation_qualifier: confirmation_qualifier.into(),
            timestamp,
        }
    }
}

/// Everything a producer needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableState<T> {
    /// Next sequence number to assign.
    pub current_seq_nr: SeqNr,
    pub highest_confirmed_seq_nr: SeqNr,
    pub confirmed_seq_nr: HashMap<ConfirmationQualifier, (SeqNr, Timestamp)>,
    /// Ordered by `seq_nr`.
    pub unconfirmed: Vec<MessageSent<T>>,
}

impl<T> Default for DurableState<T> {
    fn default() -> Self {
        Self {
            current_seq_nr: 1,
            highest_confirmed_seq_nr: 0,
            confirmed_seq_nr: HashMap::new(),
            unconfirmed: Vec::new(),
        }
    }
}

impl<T> DurableState<T> {
    /// Record a written message.
    ///
    /// A seq nr below `current_seq_nr` is a replayed write and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns `OutOfOrder` if the seq nr skips ahead of `current_seq_nr`.
    pub fn add_message_sent(&mut self, sent: MessageSent<T>) -> Result<(), DurableQueueError> {
        if sent.seq_nr < self.current_seq_nr {
            return Ok(());
        }
        if sent.seq_nr > self.current_seq_nr {
            return Err(DurableQueueError::OutOfOrder {
                expected: self.current_seq_nr,
                actual: sent.seq_nr,
            });
        }
        self.current_seq_nr = sent.seq_nr.saturating_add(1);
        self.unconfirmed.push(sent);
        Ok(())
    }

    /// Record a confirmation for `qualifier`. Lower or equal values are no-ops.
    pub fn add_confirmed(
        &mut self,
        seq_nr: SeqNr,
        qualifier: &str,
        timestamp: Timestamp,
    ) {
        let previous = self
            .confirmed_seq_nr
            .get(qualifier)
            .map_or(0, |(confirmed, _)| *confirmed);
        if seq_nr <= previous {
            return;
        }

        self.unconfirmed
            .retain(|m| !(m.confirmation_qualifier == qualifier && m.seq_nr <= seq_nr));
        self.highest_confirmed_seq_nr = self.highest_confirmed_seq_nr.max(seq_nr);
        self.confirmed_seq_nr
            .insert(qualifier.to_string(), (seq_nr, timestamp));
    }

    /// Forget the confirmation bookkeeping of retired qualifiers.
    pub fn cleanup(&mut self, qualifiers: &HashSet<ConfirmationQualifier>) {
        self.confirmed_seq_nr.retain(|q, _| !qualifiers.contains(q));
    }

    /// Confirmed seq nr recorded for `qualifier`, 0 if none.
    #[must_use]
    pub fn confirmed_for(&self, qualifier: &str) -> SeqNr {
        self.confirmed_seq_nr
            .get(qualifier)
            .map_or(0, |(confirmed, _)| *confirmed)
    }
}

/// Storage backend for a producer's write-ahead log.
///
/// Implementations must be idempotent under retry: replaying a
/// `store_message_sent` for an already stored seq nr succeeds without effect.
#[async_trait]
pub trait DurableProducerQueue<T: Payload>: Send + Sync {
    /// Load the persisted state.
    async fn load_state(&self) -> Result<DurableState<T>, DurableQueueError>;

    /// Persist a message before it is sent.
    async fn store_message_sent(&self, sent: MessageSent<T>) -> Result<(), DurableQueueError>;

    /// Persist that everything up to `seq_nr` for `qualifier` was confirmed.
    async fn store_message_confirmed(
        &self,
        seq_nr: SeqNr,
        qualifier: ConfirmationQualifier,
        timestamp: Timestamp,
    ) -> Result<(), DurableQueueError>;

    /// Drop bookkeeping for qualifiers that are no longer in use.
    async fn cleanup(
        &self,
        qualifiers: HashSet<ConfirmationQualifier>,
    ) -> Result<(), DurableQueueError>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::arithmetic_side_effects)]

    use proptest::prelude::*;

    use super::*;
    use crate::types::NO_QUALIFIER;

    fn sent(seq_nr: SeqNr, qualifier: &str) -> MessageSent<String> {
        MessageSent::new(seq_nr, format!("m{seq_nr}"), false, qualifier, 0)
    }

    fn state_with(seqs: std::ops::RangeInclusive<SeqNr>, qualifier: &str) -> DurableState<String> {
        let mut state = DurableState::default();
        for seq in seqs {
            state.add_message_sent(sent(seq, qualifier)).expect("in order");
        }
        state
    }

    #[test]
    fn should_advance_current_seq_nr_on_sent() {
        let state = state_with(1..=3, NO_QUALIFIER);
        assert_eq!(state.current_seq_nr, 4);
        assert_eq!(state.unconfirmed.len(), 3);
    }

    #[test]
    fn should_treat_replayed_sent_as_noop() {
        let mut state = state_with(1..=3, NO_QUALIFIER);
        assert!(state.add_message_sent(sent(2, NO_QUALIFIER)).is_ok());
        assert_eq!(state.current_seq_nr, 4);
        assert_eq!(state.unconfirmed.len(), 3);
    }

    #[test]
    fn should_reject_gap_in_sent() {
        let mut state = state_with(1..=2, NO_QUALIFIER);
        let result = state.add_message_sent(sent(5, NO_QUALIFIER));
        assert_eq!(
            result,
            Err(DurableQueueError::OutOfOrder {
                expected: 3,
                actual: 5
            })
        );
    }

    #[test]
    fn should_remove_confirmed_only_for_matching_qualifier() {
        let mut state = DurableState::default();
        state.add_message_sent(sent(1, "a")).expect("in order");
        state.add_message_sent(sent(2, "b")).expect("in order");
        state.add_message_sent(sent(3, "a")).expect("in order");

        state.add_confirmed(3, "a", 10);

        let remaining: Vec<_> = state.unconfirmed.iter().map(|m| m.seq_nr).collect();
        assert_eq!(remaining, vec![2]);
        assert_eq!(state.confirmed_for("a"), 3);
        assert_eq!(state.highest_confirmed_seq_nr, 3);
    }

    #[test]
    fn should_cleanup_retired_qualifiers() {
        let mut state: DurableState<String> = DurableState::default();
        state.add_confirmed(4, "a", 1);
        state.add_confirmed(5, "b", 1);

        state.cleanup(&HashSet::from(["a".to_string()]));

        assert_eq!(state.confirmed_for("a"), 0);
        assert_eq!(state.confirmed_for("b"), 5);
    }

    proptest! {
        #[test]
        fn confirmation_is_monotonic(confirms in proptest::collection::vec(0i64..20, 1..30)) {
            let mut state = state_with(1..=20, NO_QUALIFIER);
            let mut highest = 0;
            for seq in confirms {
                state.add_confirmed(seq, NO_QUALIFIER, 0);
                highest = highest.max(seq);
                prop_assert_eq!(state.confirmed_for(NO_QUALIFIER), highest);
                prop_assert!(state.unconfirmed.iter().all(|m| m.seq_nr > highest));
                prop_assert_eq!(state.unconfirmed.len(), usize::try_from(20 - highest).unwrap());
            }
        }
    }
}
