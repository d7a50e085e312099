//! ProducerController actor.
//!
//! Sits between an application producer and a ConsumerController. It assigns
//! sequence numbers, keeps sent messages until they are confirmed and only
//! asks the producer for more when the consumer granted demand.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{debug, error, info, warn};

use super::state::{AwaitingWrite, Pending, ProducerState, Unconfirmed};
use crate::durable::{DurableProducerQueue, MessageSent};
use crate::errors::{DeliveryError, DurableQueueError};
use crate::messages::{
    ConfirmationReply, ConsumerControllerMessage, ConsumerDestination, ProducerControllerMessage,
    ProducerLink, ProducerSignal, RequestNext, ResolvedDestination, SequencedMessage,
};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::settings::ProducerControllerSettings;
use crate::timers::{check_interval, start_periodic};
use crate::types::{NO_QUALIFIER, Payload, ProducerId, SeqNr, timestamp_millis};

/// The ProducerController actor definition.
pub struct ProducerControllerActor<T>(PhantomData<fn() -> T>);

impl<T> ProducerControllerActor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ProducerControllerActor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments passed to the actor on startup.
pub struct ProducerControllerArguments<T> {
    pub producer_id: ProducerId,
    pub settings: ProducerControllerSettings,
    pub durable: Option<Arc<dyn DurableProducerQueue<T>>>,
    pub link: Option<ProducerLink<T>>,
    pub destination: Option<ConsumerDestination<T>>,
}

impl<T: Payload> ProducerControllerArguments<T> {
    pub fn new(producer_id: impl Into<ProducerId>) -> Self {
        Self {
            producer_id: producer_id.into(),
            settings: ProducerControllerSettings::default(),
            durable: None,
            link: None,
            destination: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ProducerControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Back the controller with a durable queue.
    #[must_use]
    pub fn with_durable_queue(mut self, queue: Arc<dyn DurableProducerQueue<T>>) -> Self {
        self.durable = Some(queue);
        self
    }

    /// Register the producer up front instead of through `Start`.
    #[must_use]
    pub fn with_producer(mut self, producer: ActorRef<ProducerSignal<T>>) -> Self {
        self.link = Some(ProducerLink::Actor(producer));
        self
    }

    /// Register the consumer up front instead of through `RegisterConsumer`.
    #[must_use]
    pub fn with_consumer(mut self, consumer: ActorRef<ConsumerControllerMessage<T>>) -> Self {
        self.destination = Some(ConsumerDestination::Direct(consumer));
        self
    }

    #[must_use]
    pub(crate) fn with_link(mut self, link: ProducerLink<T>) -> Self {
        self.link = Some(link);
        self
    }

    #[must_use]
    pub(crate) fn with_destination(mut self, destination: ConsumerDestination<T>) -> Self {
        self.destination = Some(destination);
        self
    }
}

impl<T: Payload> Actor for ProducerControllerActor<T> {
    type Msg = ProducerControllerMessage<T>;
    type State = ProducerState<T>;
    type Arguments = ProducerControllerArguments<T>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(
            producer_id = %args.producer_id,
            durable = args.durable.is_some(),
            "ProducerController starting"
        );

        let loaded = match &args.durable {
            Some(queue) => {
                let policy = RetryPolicy::from(&args.settings);
                let loaded = retry_with_backoff(policy, "load_state", || {
                    let queue = Arc::clone(queue);
                    async move { queue.load_state().await }
                })
                .await
                .map_err(|e| {
                    error!(producer_id = %args.producer_id, error = %e, "Failed to load durable state");
                    DeliveryError::from(e)
                })?;
                info!(
                    producer_id = %args.producer_id,
                    current_seq_nr = loaded.current_seq_nr,
                    unconfirmed = loaded.unconfirmed.len(),
                    "Recovered durable producer state"
                );
                Some(loaded)
            }
            None => None,
        };

        let idle_timeout = args.settings.resend_first_unconfirmed_idle_timeout;
        let mut state = ProducerState::new(
            args.producer_id,
            args.settings,
            args.durable,
            args.link,
            args.destination,
            loaded,
        );
        state.resend_timer = start_periodic(myself.clone(), check_interval(idle_timeout), || {
            ProducerControllerMessage::ResendFirstUnconfirmed
        });

        Self::try_activate(&myself, &mut state)?;
        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = &state.resend_timer {
            timer.stop();
        }
        info!(
            producer_id = %state.producer_id,
            current_seq_nr = state.current_seq_nr,
            unconfirmed = state.unconfirmed.len(),
            "ProducerController stopped"
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let result = Self::dispatch(&myself, message, state)
            .and_then(|()| Self::replay_stash(&myself, state));

        if let Err(e) = result {
            error!(producer_id = %state.producer_id, error = %e, "ProducerController stopping");
            return Err(e.into());
        }
        Ok(())
    }
}

impl<T: Payload> ProducerControllerActor<T> {
    fn dispatch(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        message: ProducerControllerMessage<T>,
        state: &mut ProducerState<T>,
    ) -> Result<(), DeliveryError> {
        if state.awaiting_write.is_some() {
            return match message {
                ProducerControllerMessage::StoreMessageSentCompleted { seq_nr } => {
                    Self::handle_store_completed(myself, state, seq_nr)
                }
                ProducerControllerMessage::StoreMessageSentFailed { seq_nr, error } => {
                    Self::handle_store_failed(state, seq_nr, error)
                }
                ProducerControllerMessage::GetState { reply } => {
                    let _ = reply.send(state.snapshot());
                    Ok(())
                }
                other => state.stash_message(other),
            };
        }

        match message {
            ProducerControllerMessage::Start { producer } => {
                Self::handle_start(myself, state, producer)
            }
            ProducerControllerMessage::RegisterConsumer {
                consumer_controller,
            } => Self::handle_register_consumer(myself, state, consumer_controller),
            ProducerControllerMessage::Msg { message } => {
                Self::handle_msg(myself, state, message, None)
            }
            ProducerControllerMessage::MessageWithConfirmation { message, reply_to } => {
                Self::handle_msg(myself, state, message, Some(reply_to))
            }
            ProducerControllerMessage::Request {
                confirmed_seq_nr,
                requested_seq_nr,
                support_resend,
                via_timeout,
            } => Self::handle_request(
                myself,
                state,
                confirmed_seq_nr,
                requested_seq_nr,
                support_resend,
                via_timeout,
            ),
            ProducerControllerMessage::Resend { from_seq_nr } => {
                Self::handle_resend(myself, state, from_seq_nr);
                Ok(())
            }
            ProducerControllerMessage::Ack { confirmed_seq_nr } => {
                Self::confirm(state, confirmed_seq_nr);
                Self::pump(myself, state)
            }
            ProducerControllerMessage::ResendFirstUnconfirmed => {
                Self::handle_resend_first_unconfirmed(myself, state)
            }
            ProducerControllerMessage::StoreMessageSentCompleted { seq_nr }
            | ProducerControllerMessage::StoreMessageSentFailed { seq_nr, .. } => {
                warn!(
                    producer_id = %state.producer_id,
                    seq_nr,
                    "Durable write completion without a write in flight"
                );
                Ok(())
            }
            ProducerControllerMessage::GetState { reply } => {
                let _ = reply.send(state.snapshot());
                Ok(())
            }
        }
    }

    /// Process messages stashed during a durable write, in arrival order.
    fn replay_stash(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
    ) -> Result<(), DeliveryError> {
        while state.awaiting_write.is_none() {
            let Some(message) = state.stash.pop_front() else {
                break;
            };
            Self::dispatch(myself, message, state)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACTIVATION
    // ═══════════════════════════════════════════════════════════════════════

    fn try_activate(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
    ) -> Result<(), DeliveryError> {
        if state.active || state.link.is_none() {
            return Ok(());
        }
        let Some((target, _)) = Self::resolve_target(state) else {
            debug!(producer_id = %state.producer_id, "Destination not resolvable yet");
            return Ok(());
        };

        state.active = true;
        info!(
            producer_id = %state.producer_id,
            current_seq_nr = state.current_seq_nr,
            unconfirmed = state.unconfirmed.len(),
            "ProducerController active"
        );

        if let Some(head) = state.unconfirmed.front().map(|u| u.seq_nr) {
            state.first_seq_nr = head;
            Self::resend_from(myself, state, &target, head, false);
        }
        Self::pump(myself, state)
    }

    fn handle_start(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        producer: ActorRef<ProducerSignal<T>>,
    ) -> Result<(), DeliveryError> {
        debug!(producer_id = %state.producer_id, "Producer registered");
        state.link = Some(ProducerLink::Actor(producer));
        state.request_next_outstanding = false;
        if state.active {
            Self::pump(myself, state)
        } else {
            Self::try_activate(myself, state)
        }
    }

    fn handle_register_consumer(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        consumer_controller: ActorRef<ConsumerControllerMessage<T>>,
    ) -> Result<(), DeliveryError> {
        state.destination = Some(ConsumerDestination::Direct(consumer_controller));
        if !state.active {
            return Self::try_activate(myself, state);
        }
        if let Some((target, true)) = Self::resolve_target(state) {
            Self::resend_all(myself, state, &target);
        }
        Self::pump(myself, state)
    }

    /// Resolve the destination. A changed destination restarts the stream
    /// at the oldest unconfirmed message; the caller re-sends everything.
    fn resolve_target(state: &mut ProducerState<T>) -> Option<(ResolvedDestination<T>, bool)> {
        let target = state.destination.as_ref()?.resolve()?;
        let id = target.id();
        let changed = state.last_target.is_some_and(|previous| previous != id);
        if changed {
            state.first_seq_nr = state
                .unconfirmed
                .front()
                .map_or(state.current_seq_nr, |head| head.seq_nr);
            info!(
                producer_id = %state.producer_id,
                destination = %id,
                requeued = state.unconfirmed.len(),
                "Destination changed, requeueing unconfirmed messages"
            );
        }
        state.last_target = Some(id);
        Some((target, changed))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SENDING
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_msg(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        message: T,
        reply: Option<ConfirmationReply>,
    ) -> Result<(), DeliveryError> {
        if !state.has_capacity() {
            let buffered = state.buffered();
            let capacity = state.settings.buffer_size;
            debug!(producer_id = %state.producer_id, buffered, capacity, "Rejecting message, buffer full");
            return match (reply, &state.link) {
                (Some(reply), _) => {
                    let _ = reply.send(Err(DeliveryError::Backpressure { buffered, capacity }));
                    Ok(())
                }
                (None, Some(ProducerLink::Actor(producer))) => {
                    let _ = producer.send_message(ProducerSignal::Backpressure {
                        message,
                        buffered,
                        capacity,
                    });
                    Ok(())
                }
                (None, Some(ProducerLink::Sharded { entity_id, .. })) => {
                    Err(DeliveryError::protocol_violation(format!(
                        "entity {entity_id} was sent a message without demand"
                    )))
                }
                (None, None) => Ok(()),
            };
        }

        state.request_next_outstanding = false;
        state.pending.push_back(Pending { message, reply });
        Self::pump(myself, state)
    }

    /// Send pending messages while there is demand, then ask for more.
    fn pump(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
    ) -> Result<(), DeliveryError> {
        while state.active && state.awaiting_write.is_none() && state.has_demand() {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            Self::send_or_store(myself, state, next);
        }

        let wants_more = state.active
            && state.awaiting_write.is_none()
            && state.pending.is_empty()
            && state.has_demand()
            && state.has_capacity()
            && !state.request_next_outstanding;
        if !wants_more {
            return Ok(());
        }

        if let Some(link) = &state.link {
            let next = RequestNext {
                producer_id: state.producer_id.clone(),
                current_seq_nr: state.current_seq_nr,
                confirmed_seq_nr: state.confirmed_seq_nr,
                send_next_to: myself.clone(),
            };
            match link.request_next(next) {
                Ok(()) => state.request_next_outstanding = true,
                Err(e) => warn!(producer_id = %state.producer_id, error = %e, "Producer unreachable"),
            }
        }
        Ok(())
    }

    fn send_or_store(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        pending: Pending<T>,
    ) {
        let seq_nr = state.current_seq_nr;
        let Pending { message, reply } = pending;

        if let Some(queue) = state.durable.clone() {
            let ack = state.is_sharded();
            let sent = MessageSent::new(seq_nr, message.clone(), ack, NO_QUALIFIER, timestamp_millis());
            Self::spawn_store_message_sent(myself, queue, RetryPolicy::from(&state.settings), sent);
            debug!(producer_id = %state.producer_id, seq_nr, "Awaiting durable write");
            state.awaiting_write = Some(AwaitingWrite {
                seq_nr,
                message,
                ack,
                reply,
            });
            return;
        }

        let ack = reply.is_some() || state.is_sharded();
        if let Some(reply) = reply {
            state.replies.insert(seq_nr, reply);
        }
        Self::transmit(myself, state, message, ack);
    }

    /// Assign `current_seq_nr` to the message and send it.
    fn transmit(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        message: T,
        ack: bool,
    ) {
        let seq_nr = state.current_seq_nr;
        if state.support_resend {
            state.unconfirmed.push_back(Unconfirmed {
                seq_nr,
                message: message.clone(),
                ack,
                last_sent: Instant::now(),
            });
        }
        let target = Self::resolve_target(state);
        state.current_seq_nr = seq_nr.saturating_add(1);

        match target {
            Some((target, true)) if state.support_resend => {
                Self::resend_all(myself, state, &target);
            }
            Some((target, _)) => {
                let first = seq_nr == state.first_seq_nr;
                debug!(producer_id = %state.producer_id, seq_nr, first, "Sending message");
                let msg = Self::sequenced(myself, state, seq_nr, message, ack, first);
                if let Err(e) = target.send(msg) {
                    debug!(producer_id = %state.producer_id, seq_nr, error = %e, "Send failed, kept for resend");
                }
            }
            None => {
                debug!(producer_id = %state.producer_id, seq_nr, "No destination, kept for resend");
            }
        }
    }

    fn sequenced(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &ProducerState<T>,
        seq_nr: SeqNr,
        message: T,
        ack: bool,
        first: bool,
    ) -> SequencedMessage<T> {
        SequencedMessage {
            producer_id: state.producer_id.clone(),
            seq_nr,
            message,
            first,
            ack,
            producer_controller: myself.clone(),
        }
    }

    fn resend_all(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        target: &ResolvedDestination<T>,
    ) {
        Self::resend_from(myself, state, target, SeqNr::MIN, false);
    }

    /// Re-send unconfirmed messages with `seq_nr >= from_seq_nr`.
    ///
    /// `force_first` marks the oldest retained message as `first`.
    fn resend_from(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        target: &ResolvedDestination<T>,
        from_seq_nr: SeqNr,
        force_first: bool,
    ) {
        let now = Instant::now();
        let head = state.unconfirmed.front().map(|u| u.seq_nr);
        let first_seq_nr = state.first_seq_nr;
        let producer_id = state.producer_id.clone();

        let resends: Vec<SequencedMessage<T>> = state
            .unconfirmed
            .iter_mut()
            .filter(|entry| entry.seq_nr >= from_seq_nr)
            .map(|entry| {
                entry.last_sent = now;
                SequencedMessage {
                    producer_id: producer_id.clone(),
                    seq_nr: entry.seq_nr,
                    message: entry.message.clone(),
                    first: entry.seq_nr == first_seq_nr
                        || (force_first && Some(entry.seq_nr) == head),
                    ack: entry.ack,
                    producer_controller: myself.clone(),
                }
            })
            .collect();

        debug!(
            producer_id = %producer_id,
            from_seq_nr = resends.first().map(|m| m.seq_nr),
            count = resends.len(),
            "Resending unconfirmed messages"
        );
        for msg in resends {
            if let Err(e) = target.send(msg) {
                debug!(producer_id = %producer_id, error = %e, "Resend failed");
                break;
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONSUMER FEEDBACK
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_request(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        confirmed_seq_nr: SeqNr,
        requested_seq_nr: SeqNr,
        support_resend: bool,
        via_timeout: bool,
    ) -> Result<(), DeliveryError> {
        debug!(
            producer_id = %state.producer_id,
            confirmed_seq_nr,
            requested_seq_nr,
            support_resend,
            via_timeout,
            "Received Request"
        );

        Self::confirm(state, confirmed_seq_nr);
        state.raise_requested(requested_seq_nr);

        state.support_resend = support_resend;
        if !support_resend {
            state.unconfirmed.clear();
        }

        if via_timeout && !state.unconfirmed.is_empty() {
            if let Some((target, _)) = Self::resolve_target(state) {
                Self::resend_all(myself, state, &target);
            }
        }

        Self::pump(myself, state)
    }

    fn handle_resend(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        from_seq_nr: SeqNr,
    ) {
        if !state.support_resend {
            debug!(producer_id = %state.producer_id, from_seq_nr, "Ignoring Resend, resend not supported");
            return;
        }
        let Some(head) = state.unconfirmed.front().map(|u| u.seq_nr) else {
            debug!(producer_id = %state.producer_id, from_seq_nr, "Nothing to resend");
            return;
        };
        let Some((target, changed)) = Self::resolve_target(state) else {
            return;
        };

        if changed {
            Self::resend_all(myself, state, &target);
        } else {
            Self::resend_from(myself, state, &target, from_seq_nr, from_seq_nr < head);
        }
    }

    /// Prune confirmed messages, answer asks and record the confirmation.
    fn confirm(state: &mut ProducerState<T>, confirmed_seq_nr: SeqNr) {
        let Some((confirmed, replies)) = state.confirm_up_to(confirmed_seq_nr) else {
            return;
        };
        debug!(producer_id = %state.producer_id, confirmed_seq_nr = confirmed, "Confirmed");

        for (seq_nr, reply) in replies {
            let _ = reply.send(Ok(seq_nr));
        }

        if let Some(queue) = state.durable.clone() {
            let producer_id = state.producer_id.clone();
            tokio::spawn(async move {
                if let Err(e) = queue
                    .store_message_confirmed(confirmed, NO_QUALIFIER.to_string(), timestamp_millis())
                    .await
                {
                    warn!(
                        producer_id = %producer_id,
                        seq_nr = confirmed,
                        error = %e,
                        "Failed to store confirmation, messages may be redelivered after restart"
                    );
                }
            });
        }

        if let Some(link) = &state.link {
            if let Err(e) = link.confirmed(confirmed) {
                debug!(producer_id = %state.producer_id, error = %e, "Could not report confirmation");
            }
        }
    }

    fn handle_resend_first_unconfirmed(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
    ) -> Result<(), DeliveryError> {
        if !state.active {
            return Self::try_activate(myself, state);
        }
        let idle_timeout = state.settings.resend_first_unconfirmed_idle_timeout;
        let Some(head) = state.unconfirmed.front() else {
            return Ok(());
        };
        if head.last_sent.elapsed() < idle_timeout {
            return Ok(());
        }
        let head_seq_nr = head.seq_nr;

        match Self::resolve_target(state) {
            Some((target, true)) => Self::resend_all(myself, state, &target),
            Some((target, false)) => {
                debug!(producer_id = %state.producer_id, seq_nr = head_seq_nr, "Resending first unconfirmed");
                let first_seq_nr = state.first_seq_nr;
                let producer_id = state.producer_id.clone();
                if let Some(entry) = state.unconfirmed.front_mut() {
                    entry.last_sent = Instant::now();
                    let msg = SequencedMessage {
                        producer_id,
                        seq_nr: entry.seq_nr,
                        message: entry.message.clone(),
                        first: entry.seq_nr == first_seq_nr,
                        ack: entry.ack,
                        producer_controller: myself.clone(),
                    };
                    let _ = target.send(msg);
                }
            }
            None => {}
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DURABLE WRITES
    // ═══════════════════════════════════════════════════════════════════════

    fn spawn_store_message_sent(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        queue: Arc<dyn DurableProducerQueue<T>>,
        policy: RetryPolicy,
        sent: MessageSent<T>,
    ) {
        let myself = myself.clone();
        tokio::spawn(async move {
            let seq_nr = sent.seq_nr;
            let result = retry_with_backoff(policy, "store_message_sent", || {
                let queue = Arc::clone(&queue);
                let sent = sent.clone();
                async move { queue.store_message_sent(sent).await }
            })
            .await;

            let outcome = match result {
                Ok(()) => ProducerControllerMessage::StoreMessageSentCompleted { seq_nr },
                Err(error) => ProducerControllerMessage::StoreMessageSentFailed { seq_nr, error },
            };
            let _ = myself.send_message(outcome);
        });
    }

    fn handle_store_completed(
        myself: &ActorRef<ProducerControllerMessage<T>>,
        state: &mut ProducerState<T>,
        seq_nr: SeqNr,
    ) -> Result<(), DeliveryError> {
        let Some(write) = state.awaiting_write.take() else {
            return Ok(());
        };
        if write.seq_nr != seq_nr {
            state.awaiting_write = Some(write);
            return Err(DeliveryError::protocol_violation(format!(
                "durable write completed for seq nr {seq_nr} while awaiting another"
            )));
        }

        debug!(producer_id = %state.producer_id, seq_nr, "Durable write completed");
        if let Some(reply) = write.reply {
            let _ = reply.send(Ok(seq_nr));
        }
        Self::transmit(myself, state, write.message, write.ack);
        Self::pump(myself, state)
    }

    fn handle_store_failed(
        state: &mut ProducerState<T>,
        seq_nr: SeqNr,
        error: DurableQueueError,
    ) -> Result<(), DeliveryError> {
        error!(
            producer_id = %state.producer_id,
            seq_nr,
            error = %error,
            "Durable write failed after retries"
        );
        if let Some(reply) = state.awaiting_write.take().and_then(|write| write.reply) {
            let _ = reply.send(Err(DeliveryError::DurableQueue(error.clone())));
        }
        Err(DeliveryError::DurableQueue(error))
    }
}
