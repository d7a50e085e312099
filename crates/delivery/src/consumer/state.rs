//! ConsumerController bookkeeping.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use ractor::ActorRef;

use crate::messages::{
    ConsumerSnapshot, Delivery, ProducerControllerMessage, SequencedMessage,
};
use crate::settings::ConsumerControllerSettings;
use crate::timers::TimerHandle;
use crate::types::{Payload, ProducerId, SeqNr, window};

/// The message handed to the consumer and not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub seq_nr: SeqNr,
    pub ack: bool,
}

/// State of a ConsumerController.
pub struct ConsumerState<T: Payload> {
    pub(crate) settings: ConsumerControllerSettings,
    pub(crate) deliver_to: Option<ActorRef<Delivery<T>>>,

    pub(crate) producer_id: Option<ProducerId>,
    pub(crate) producer: Option<ActorRef<ProducerControllerMessage<T>>>,
    /// Producer we registered with and keep re-registering until traffic arrives.
    pub(crate) registering: Option<ActorRef<ProducerControllerMessage<T>>>,

    pub(crate) expected_seq_nr: SeqNr,
    pub(crate) confirmed_seq_nr: SeqNr,
    pub(crate) requested_seq_nr: SeqNr,
    pub(crate) buffered: BTreeMap<SeqNr, SequencedMessage<T>>,
    pub(crate) in_flight: Option<InFlight>,

    pub(crate) resend_requested: Option<SeqNr>,
    pub(crate) gap_detected_at: Option<Instant>,
    pub(crate) last_activity: Instant,

    /// Resets that arrived while a delivery was in flight.
    pub(crate) stash: VecDeque<SequencedMessage<T>>,
    /// Messages that arrived before `Start`.
    pub(crate) pending_start: VecDeque<SequencedMessage<T>>,
    pub(crate) stopping: bool,
    pub(crate) retry_timer: Option<TimerHandle>,
}

impl<T: Payload> ConsumerState<T> {
    pub(crate) fn new(
        settings: ConsumerControllerSettings,
        deliver_to: Option<ActorRef<Delivery<T>>>,
    ) -> Self {
        Self {
            settings,
            deliver_to,
            producer_id: None,
            producer: None,
            registering: None,
            expected_seq_nr: 1,
            confirmed_seq_nr: 0,
            requested_seq_nr: 0,
            buffered: BTreeMap::new(),
            in_flight: None,
            resend_requested: None,
            gap_detected_at: None,
            last_activity: Instant::now(),
            stash: VecDeque::new(),
            pending_start: VecDeque::new(),
            stopping: false,
            retry_timer: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.deliver_to.is_some()
    }

    pub(crate) fn is_fresh(&self) -> bool {
        self.producer_id.is_none()
    }

    pub(crate) fn window(&self) -> SeqNr {
        window(self.settings.buffer_size)
    }

    /// The message comes from a different producer (or producer incarnation)
    /// than the one this controller follows.
    pub(crate) fn is_other_producer(&self, msg: &SequencedMessage<T>) -> bool {
        let other_id = self
            .producer_id
            .as_ref()
            .is_some_and(|id| *id != msg.producer_id);
        let other_ref = self
            .producer
            .as_ref()
            .is_some_and(|p| p.get_id() != msg.producer_controller.get_id());
        !self.is_fresh() && (other_id || other_ref)
    }

    /// Lowest seq nr that is neither in flight nor buffered.
    pub(crate) fn first_missing(&self) -> SeqNr {
        let mut missing = match self.in_flight {
            Some(in_flight) => in_flight.seq_nr.saturating_add(1),
            None => self.expected_seq_nr,
        };
        while self.buffered.contains_key(&missing) {
            missing = missing.saturating_add(1);
        }
        missing
    }

    /// Something is missing below the highest buffered message.
    pub(crate) fn has_gap(&self) -> bool {
        self.buffered
            .last_key_value()
            .is_some_and(|(highest, _)| self.first_missing() < *highest)
    }

    pub(crate) fn is_duplicate(&self, seq_nr: SeqNr) -> bool {
        seq_nr < self.expected_seq_nr
            || self.in_flight.is_some_and(|f| f.seq_nr == seq_nr)
            || self.buffered.contains_key(&seq_nr)
    }

    /// `seq_nr` lies past the demand granted to the producer.
    pub(crate) fn is_beyond_demand(&self, seq_nr: SeqNr) -> bool {
        seq_nr > self.requested_seq_nr
    }

    /// No further message within demand can be buffered: either the buffer
    /// is at capacity or the highest buffered seq nr reached the requested one.
    pub(crate) fn is_buffer_exhausted(&self) -> bool {
        self.buffered.len() >= self.settings.buffer_size
            || self
                .buffered
                .last_key_value()
                .is_some_and(|(highest, _)| *highest >= self.requested_seq_nr)
    }

    /// Forget the stream and continue at `seq_nr`.
    pub(crate) fn reset_to(&mut self, msg: &SequencedMessage<T>) {
        self.producer_id = Some(msg.producer_id.clone());
        self.producer = Some(msg.producer_controller.clone());
        self.expected_seq_nr = msg.seq_nr;
        self.confirmed_seq_nr = msg.seq_nr.saturating_sub(1);
        self.requested_seq_nr = self.confirmed_seq_nr;
        self.buffered.clear();
        self.resend_requested = None;
        self.gap_detected_at = None;
    }

    /// Outstanding demand fell to the low-water mark.
    pub(crate) fn needs_more_demand(&self) -> bool {
        let outstanding = self.requested_seq_nr.saturating_sub(self.confirmed_seq_nr);
        outstanding <= self.window() / 2
    }

    pub(crate) fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            producer_id: self.producer_id.clone(),
            active: self.is_active(),
            expected_seq_nr: self.expected_seq_nr,
            confirmed_seq_nr: self.confirmed_seq_nr,
            requested_seq_nr: self.requested_seq_nr,
            buffered: self.buffered.keys().copied().collect(),
            in_flight: self.in_flight.map(|f| f.seq_nr),
            resend_requested: self.resend_requested,
        }
    }
}
