//! ConsumerController actor.
//!
//! Delivers one message at a time to the application consumer, in seq nr
//! order, and grants the producer demand in windows of `buffer_size`.

use std::marker::PhantomData;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{debug, error, info, warn};

use super::state::{ConsumerState, InFlight};
use crate::errors::DeliveryError;
use crate::messages::{ConsumerControllerMessage, Delivery, ProducerControllerMessage, SequencedMessage};
use crate::settings::ConsumerControllerSettings;
use crate::timers::start_periodic;
use crate::types::{Payload, SeqNr};

/// The ConsumerController actor definition.
pub struct ConsumerControllerActor<T>(PhantomData<fn() -> T>);

impl<T> ConsumerControllerActor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ConsumerControllerActor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments passed to the actor on startup.
pub struct ConsumerControllerArguments<T> {
    pub settings: ConsumerControllerSettings,
    /// Consumer to deliver to; without it the controller waits for `Start`.
    pub deliver_to: Option<ActorRef<Delivery<T>>>,
}

impl<T> Default for ConsumerControllerArguments<T> {
    fn default() -> Self {
        Self {
            settings: ConsumerControllerSettings::default(),
            deliver_to: None,
        }
    }
}

impl<T> ConsumerControllerArguments<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ConsumerControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_consumer(mut self, deliver_to: ActorRef<Delivery<T>>) -> Self {
        self.deliver_to = Some(deliver_to);
        self
    }
}

impl<T: Payload> Actor for ConsumerControllerActor<T> {
    type Msg = ConsumerControllerMessage<T>;
    type State = ConsumerState<T>;
    type Arguments = ConsumerControllerArguments<T>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(
            buffer_size = args.settings.buffer_size,
            only_flow_control = args.settings.only_flow_control,
            "ConsumerController starting"
        );
        let interval = args.settings.resend_interval;
        let mut state = ConsumerState::new(args.settings, args.deliver_to);
        state.retry_timer = start_periodic(myself, interval, || ConsumerControllerMessage::Retry);
        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = &state.retry_timer {
            timer.stop();
        }
        info!(
            producer_id = ?state.producer_id,
            confirmed_seq_nr = state.confirmed_seq_nr,
            "ConsumerController stopped"
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let result = match message {
            ConsumerControllerMessage::Start { deliver_to } => {
                Self::handle_start(&myself, state, deliver_to)
            }
            ConsumerControllerMessage::RegisterToProducerController {
                producer_controller,
            } => {
                Self::handle_register(&myself, state, producer_controller);
                Ok(())
            }
            ConsumerControllerMessage::Sequenced(msg) => Self::handle_sequenced(&myself, state, msg),
            ConsumerControllerMessage::Confirmed => Self::handle_confirmed(&myself, state),
            ConsumerControllerMessage::DeliverThenStop => {
                state.stopping = true;
                Self::stop_if_drained(&myself, state);
                Ok(())
            }
            ConsumerControllerMessage::Retry => Self::handle_retry(&myself, state),
            ConsumerControllerMessage::GetState { reply } => {
                let _ = reply.send(state.snapshot());
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(producer_id = ?state.producer_id, error = %e, "ConsumerController stopping");
            return Err(e.into());
        }
        Ok(())
    }
}

impl<T: Payload> ConsumerControllerActor<T> {
    fn handle_start(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        deliver_to: ActorRef<Delivery<T>>,
    ) -> Result<(), DeliveryError> {
        debug!("Consumer registered");
        state.deliver_to = Some(deliver_to);

        if state.producer.is_some() {
            let confirmed = state.confirmed_seq_nr;
            Self::request(state, confirmed, false);
        }

        while let Some(msg) = state.pending_start.pop_front() {
            Self::handle_sequenced(myself, state, msg)?;
        }
        Ok(())
    }

    fn handle_register(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        producer_controller: ActorRef<ProducerControllerMessage<T>>,
    ) {
        info!(producer_controller = %producer_controller.get_id(), "Registering to ProducerController");
        let _ = producer_controller.send_message(ProducerControllerMessage::RegisterConsumer {
            consumer_controller: myself.clone(),
        });
        state.registering = Some(producer_controller.clone());
        state.producer = Some(producer_controller);

        if state.is_active() {
            let confirmed = state.confirmed_seq_nr;
            Self::request(state, confirmed, false);
        }
    }

    fn handle_sequenced(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        msg: SequencedMessage<T>,
    ) -> Result<(), DeliveryError> {
        if !state.is_active() {
            if state.pending_start.len() >= state.settings.buffer_size {
                return Err(DeliveryError::BufferOverflow {
                    buffered: state.pending_start.len(),
                    capacity: state.settings.buffer_size,
                });
            }
            state.pending_start.push_back(msg);
            return Ok(());
        }

        state.last_activity = std::time::Instant::now();
        state.registering = None;

        let other_producer = state.is_other_producer(&msg);
        let fresh = state.is_fresh();

        if msg.first && (fresh || other_producer || msg.seq_nr > state.expected_seq_nr) {
            if state.in_flight.is_some() {
                if state.stash.len() >= state.settings.buffer_size {
                    return Err(DeliveryError::BufferOverflow {
                        buffered: state.stash.len(),
                        capacity: state.settings.buffer_size,
                    });
                }
                debug!(producer_id = %msg.producer_id, seq_nr = msg.seq_nr, "Reset waits for in-flight confirmation");
                state.stash.push_back(msg);
                return Ok(());
            }
            return Self::reset(myself, state, msg);
        }

        if other_producer {
            warn!(
                producer_id = %msg.producer_id,
                seq_nr = msg.seq_nr,
                following = ?state.producer_id,
                "Ignoring message from another producer"
            );
            return Ok(());
        }

        if fresh {
            info!(producer_id = %msg.producer_id, seq_nr = msg.seq_nr, "Adopting producer");
            state.producer_id = Some(msg.producer_id.clone());
            state.producer = Some(msg.producer_controller.clone());
            let confirmed = state.confirmed_seq_nr;
            Self::request(state, confirmed, false);
        }

        Self::accept(myself, state, msg)
    }

    /// Handle a message from the followed producer.
    fn accept(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        msg: SequencedMessage<T>,
    ) -> Result<(), DeliveryError> {
        let seq_nr = msg.seq_nr;

        if state.is_duplicate(seq_nr) {
            debug!(producer_id = %msg.producer_id, seq_nr, expected = state.expected_seq_nr, "Dropping duplicate");
            if msg.first {
                let requested = state.requested_seq_nr;
                Self::send_request(state, requested, false);
            }
            return Ok(());
        }

        if !state.settings.only_flow_control && state.is_beyond_demand(seq_nr) {
            return Err(DeliveryError::protocol_violation(format!(
                "seq nr {seq_nr} exceeds requested {}",
                state.requested_seq_nr
            )));
        }

        if seq_nr == state.expected_seq_nr && state.in_flight.is_none() {
            Self::deliver(myself, state, msg);
            return Ok(());
        }

        if state.buffered.len() >= state.settings.buffer_size {
            return Err(DeliveryError::BufferOverflow {
                buffered: state.buffered.len(),
                capacity: state.settings.buffer_size,
            });
        }
        debug!(producer_id = %msg.producer_id, seq_nr, "Buffering message");
        state.buffered.insert(seq_nr, msg);

        if state.settings.only_flow_control {
            Self::deliver_next(myself, state);
            return Ok(());
        }

        let first_missing = state.first_missing();
        if first_missing < seq_nr && state.resend_requested != Some(first_missing) {
            debug!(from_seq_nr = first_missing, "Gap detected, requesting resend");
            state.resend_requested = Some(first_missing);
            state.gap_detected_at.get_or_insert_with(std::time::Instant::now);
            Self::send_to_producer(state, ProducerControllerMessage::Resend {
                from_seq_nr: first_missing,
            });
        }
        Ok(())
    }

    /// Start following `msg`'s producer from `msg.seq_nr`.
    fn reset(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        msg: SequencedMessage<T>,
    ) -> Result<(), DeliveryError> {
        info!(
            producer_id = %msg.producer_id,
            seq_nr = msg.seq_nr,
            previous_expected = state.expected_seq_nr,
            "Resynchronising on first message"
        );
        state.reset_to(&msg);
        let confirmed = state.confirmed_seq_nr;
        Self::request(state, confirmed, false);
        Self::accept(myself, state, msg)
    }

    fn deliver(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
        msg: SequencedMessage<T>,
    ) {
        let Some(consumer) = &state.deliver_to else {
            return;
        };
        debug!(producer_id = %msg.producer_id, seq_nr = msg.seq_nr, "Delivering");
        state.in_flight = Some(InFlight {
            seq_nr: msg.seq_nr,
            ack: msg.ack,
        });
        let delivery = Delivery {
            producer_id: msg.producer_id,
            seq_nr: msg.seq_nr,
            message: msg.message,
            confirm_to: myself.clone(),
        };
        if let Err(e) = consumer.send_message(delivery) {
            warn!(error = %e, "Consumer unreachable");
        }
    }

    /// Deliver the next buffered message if nothing is in flight.
    fn deliver_next(myself: &ActorRef<ConsumerControllerMessage<T>>, state: &mut ConsumerState<T>) {
        if state.in_flight.is_some() {
            return;
        }
        let Some(&next) = state.buffered.keys().next() else {
            return;
        };
        if next != state.expected_seq_nr {
            if !state.settings.only_flow_control {
                return;
            }
            debug!(skipped_to = next, expected = state.expected_seq_nr, "Skipping gap");
            state.expected_seq_nr = next;
        }
        if let Some(msg) = state.buffered.remove(&next) {
            Self::deliver(myself, state, msg);
        }
    }

    fn handle_confirmed(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
    ) -> Result<(), DeliveryError> {
        let Some(in_flight) = state.in_flight.take() else {
            debug!("Confirmed without a message in flight");
            return Ok(());
        };

        state.last_activity = std::time::Instant::now();
        state.confirmed_seq_nr = in_flight.seq_nr;
        state.expected_seq_nr = in_flight.seq_nr.saturating_add(1);
        if in_flight.ack {
            Self::send_to_producer(state, ProducerControllerMessage::Ack {
                confirmed_seq_nr: in_flight.seq_nr,
            });
        }

        while state.in_flight.is_none() {
            let Some(stashed) = state.stash.pop_front() else {
                break;
            };
            Self::handle_sequenced(myself, state, stashed)?;
        }

        Self::deliver_next(myself, state);
        if !state.has_gap() {
            state.resend_requested = None;
            state.gap_detected_at = None;
        }

        if state.needs_more_demand() {
            let confirmed = state.confirmed_seq_nr;
            Self::request(state, confirmed, false);
        }

        Self::stop_if_drained(myself, state);
        Ok(())
    }

    fn handle_retry(
        myself: &ActorRef<ConsumerControllerMessage<T>>,
        state: &mut ConsumerState<T>,
    ) -> Result<(), DeliveryError> {
        if let Some(producer) = &state.registering {
            debug!("Repeating registration");
            let _ = producer.send_message(ProducerControllerMessage::RegisterConsumer {
                consumer_controller: myself.clone(),
            });
        }
        if !state.is_active() || state.producer.is_none() {
            return Ok(());
        }

        if let Some(from_seq_nr) = state.resend_requested {
            let waited = state
                .gap_detected_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if state.is_buffer_exhausted() && waited > state.settings.gap_timeout {
                return Err(DeliveryError::StalledGap {
                    missing: from_seq_nr,
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }
            debug!(from_seq_nr, "Repeating resend request");
            Self::send_to_producer(state, ProducerControllerMessage::Resend { from_seq_nr });
            return Ok(());
        }

        let idle = state.last_activity.elapsed() >= state.settings.resend_interval;
        if state.in_flight.is_none() && idle {
            let requested = state.requested_seq_nr;
            Self::send_request(state, requested, true);
        }
        Ok(())
    }

    /// Grant demand up to `confirmed + buffer_size`.
    fn request(state: &mut ConsumerState<T>, confirmed_seq_nr: SeqNr, via_timeout: bool) {
        let requested = confirmed_seq_nr.saturating_add(state.window());
        state.requested_seq_nr = state.requested_seq_nr.max(requested);
        let requested = state.requested_seq_nr;
        Self::send_request(state, requested, via_timeout);
    }

    fn send_request(state: &ConsumerState<T>, requested_seq_nr: SeqNr, via_timeout: bool) {
        Self::send_to_producer(state, ProducerControllerMessage::Request {
            confirmed_seq_nr: state.confirmed_seq_nr,
            requested_seq_nr,
            support_resend: !state.settings.only_flow_control,
            via_timeout,
        });
    }

    fn send_to_producer(state: &ConsumerState<T>, message: ProducerControllerMessage<T>) {
        if let Some(producer) = &state.producer {
            if let Err(e) = producer.send_message(message) {
                debug!(error = %e, "ProducerController unreachable");
            }
        }
    }

    fn stop_if_drained(myself: &ActorRef<ConsumerControllerMessage<T>>, state: &ConsumerState<T>) {
        if state.stopping && state.in_flight.is_none() && state.buffered.is_empty() {
            info!(producer_id = ?state.producer_id, "All messages delivered, stopping");
            myself.stop(Some("delivered".to_string()));
        }
    }
}
