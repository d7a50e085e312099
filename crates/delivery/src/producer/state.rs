//! ProducerController bookkeeping.
//!
//! Invariants kept here:
//! - `confirmed_seq_nr < current_seq_nr`
//! - `unconfirmed` is ordered and every entry is above `confirmed_seq_nr`
//! - `unconfirmed.len() + pending.len() <= buffer_size`

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use ractor::ActorId;

use crate::durable::{DurableProducerQueue, DurableState};
use crate::errors::DeliveryError;
use crate::messages::{
    ConfirmationReply, ConsumerDestination, ProducerControllerMessage, ProducerLink,
    ProducerSnapshot,
};
use crate::settings::ProducerControllerSettings;
use crate::timers::TimerHandle;
use crate::types::{Payload, ProducerId, SeqNr};

/// A sent message kept until the consumer confirms it.
#[derive(Debug)]
pub(crate) struct Unconfirmed<T> {
    pub seq_nr: SeqNr,
    pub message: T,
    pub ack: bool,
    pub last_sent: Instant,
}

/// A message accepted from the producer but not yet sent.
#[derive(Debug)]
pub(crate) struct Pending<T> {
    pub message: T,
    pub reply: Option<ConfirmationReply>,
}

/// The message whose `MessageSent` write is in flight.
#[derive(Debug)]
pub(crate) struct AwaitingWrite<T> {
    pub seq_nr: SeqNr,
    pub message: T,
    pub ack: bool,
    pub reply: Option<ConfirmationReply>,
}

/// State of a ProducerController.
pub struct ProducerState<T: Payload> {
    pub(crate) producer_id: ProducerId,
    pub(crate) settings: ProducerControllerSettings,
    pub(crate) durable: Option<Arc<dyn DurableProducerQueue<T>>>,
    pub(crate) link: Option<ProducerLink<T>>,
    pub(crate) destination: Option<ConsumerDestination<T>>,
    pub(crate) last_target: Option<ActorId>,
    pub(crate) active: bool,

    pub(crate) current_seq_nr: SeqNr,
    pub(crate) confirmed_seq_nr: SeqNr,
    pub(crate) requested_seq_nr: SeqNr,
    pub(crate) first_seq_nr: SeqNr,
    pub(crate) support_resend: bool,
    pub(crate) request_next_outstanding: bool,

    pub(crate) unconfirmed: VecDeque<Unconfirmed<T>>,
    pub(crate) pending: VecDeque<Pending<T>>,
    /// Asks answered at confirmation time (no durable queue).
    pub(crate) replies: BTreeMap<SeqNr, ConfirmationReply>,

    pub(crate) awaiting_write: Option<AwaitingWrite<T>>,
    pub(crate) stash: VecDeque<ProducerControllerMessage<T>>,
    pub(crate) resend_timer: Option<TimerHandle>,
}

impl<T: Payload> ProducerState<T> {
    pub(crate) fn new(
        producer_id: ProducerId,
        settings: ProducerControllerSettings,
        durable: Option<Arc<dyn DurableProducerQueue<T>>>,
        link: Option<ProducerLink<T>>,
        destination: Option<ConsumerDestination<T>>,
        loaded: Option<DurableState<T>>,
    ) -> Self {
        let loaded = loaded.unwrap_or_default();
        let now = Instant::now();
        let unconfirmed: VecDeque<Unconfirmed<T>> = loaded
            .unconfirmed
            .into_iter()
            .map(|sent| Unconfirmed {
                seq_nr: sent.seq_nr,
                message: sent.message,
                ack: sent.ack,
                last_sent: now,
            })
            .collect();

        let current_seq_nr = loaded.current_seq_nr.max(1);
        let first_seq_nr = unconfirmed
            .front()
            .map_or(current_seq_nr, |head| head.seq_nr);
        // Recovered messages are re-sent before the producer gets new demand.
        let requested_seq_nr = if unconfirmed.is_empty() {
            current_seq_nr
        } else {
            current_seq_nr.saturating_sub(1)
        };

        Self {
            producer_id,
            settings,
            durable,
            link,
            destination,
            last_target: None,
            active: false,
            current_seq_nr,
            confirmed_seq_nr: first_seq_nr.saturating_sub(1),
            requested_seq_nr,
            first_seq_nr,
            support_resend: true,
            request_next_outstanding: false,
            unconfirmed,
            pending: VecDeque::new(),
            replies: BTreeMap::new(),
            awaiting_write: None,
            stash: VecDeque::new(),
            resend_timer: None,
        }
    }

    /// Unconfirmed plus pending messages.
    pub(crate) fn buffered(&self) -> usize {
        self.unconfirmed.len().saturating_add(self.pending.len())
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.buffered() < self.settings.buffer_size
    }

    /// The consumer granted room for `current_seq_nr`.
    pub(crate) fn has_demand(&self) -> bool {
        self.current_seq_nr <= self.requested_seq_nr
    }

    pub(crate) fn is_sharded(&self) -> bool {
        matches!(self.link, Some(ProducerLink::Sharded { .. }))
    }

    pub(crate) fn raise_requested(&mut self, requested_seq_nr: SeqNr) {
        if requested_seq_nr > self.requested_seq_nr {
            self.requested_seq_nr = requested_seq_nr;
        }
    }

    /// Advance the confirmed seq nr and prune everything up to it.
    ///
    /// Returns `None` when `confirmed_seq_nr` is stale, otherwise the new
    /// confirmed seq nr together with the asks that can now be answered.
    pub(crate) fn confirm_up_to(
        &mut self,
        confirmed_seq_nr: SeqNr,
    ) -> Option<(SeqNr, Vec<(SeqNr, ConfirmationReply)>)> {
        let confirmed = confirmed_seq_nr.min(self.current_seq_nr.saturating_sub(1));
        if confirmed <= self.confirmed_seq_nr {
            return None;
        }
        self.confirmed_seq_nr = confirmed;

        while self
            .unconfirmed
            .front()
            .is_some_and(|entry| entry.seq_nr <= confirmed)
        {
            self.unconfirmed.pop_front();
        }

        let still_waiting = self.replies.split_off(&confirmed.saturating_add(1));
        let answered = std::mem::replace(&mut self.replies, still_waiting);
        Some((confirmed, answered.into_iter().collect()))
    }

    /// Hold a message until the in-flight durable write completes.
    pub(crate) fn stash_message(
        &mut self,
        message: ProducerControllerMessage<T>,
    ) -> Result<(), DeliveryError> {
        if self.stash.len() >= self.settings.stash_capacity {
            return Err(DeliveryError::StashOverflow {
                capacity: self.settings.stash_capacity,
            });
        }
        self.stash.push_back(message);
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            producer_id: self.producer_id.clone(),
            active: self.active,
            current_seq_nr: self.current_seq_nr,
            confirmed_seq_nr: self.confirmed_seq_nr,
            requested_seq_nr: self.requested_seq_nr,
            first_seq_nr: self.first_seq_nr,
            unconfirmed: self.unconfirmed.iter().map(|u| u.seq_nr).collect(),
            pending: self.pending.len(),
            stashed: self.stash.len(),
            awaiting_write: self.awaiting_write.is_some(),
            support_resend: self.support_resend,
        }
    }
}
