//! ShardingProducerController actor.
//!
//! Accepts `ShardingEnvelope`s from one producer, assigns a global seq nr and
//! hands each message to a per-entity ProducerController once that entity has
//! demand. Messages wait in per-entity buffers until then.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef};
use tracing::{debug, error, info, warn};

use super::EntityRouter;
use crate::durable::{DurableProducerQueue, MessageSent};
use crate::errors::{DeliveryError, DurableQueueError};
use crate::messages::{
    ConfirmationReply, ConsumerDestination, EntitySnapshot, ProducerControllerMessage,
    ProducerLink, RequestNext, ShardingEnvelope, ShardingProducerMessage, ShardingProducerSignal,
    ShardingProducerSnapshot, ShardingRequestNext,
};
use crate::producer::{ProducerControllerActor, ProducerControllerArguments};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::settings::ShardingProducerControllerSettings;
use crate::timers::{TimerHandle, check_interval, start_periodic};
use crate::types::{ConfirmationQualifier, EntityId, Payload, ProducerId, SeqNr, timestamp_millis};

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

/// A message routed to an entity that has no demand yet.
struct Buffered<T> {
    total_seq_nr: SeqNr,
    message: T,
    reply: Option<ConfirmationReply>,
}

/// A message handed to the entity's ProducerController.
struct Sent {
    total_seq_nr: SeqNr,
    out_seq_nr: SeqNr,
    reply: Option<ConfirmationReply>,
}

/// Per-entity outbound state.
///
/// `next_to` is only kept while `buffered` is empty.
struct OutState<T> {
    entity_id: EntityId,
    producer_controller: ActorRef<ProducerControllerMessage<T>>,
    next_to: Option<RequestNext<T>>,
    buffered: VecDeque<Buffered<T>>,
    /// Last seq nr handed to the child.
    seq_nr: SeqNr,
    unconfirmed: Vec<Sent>,
    last_used: Instant,
}

impl<T> OutState<T> {
    fn new(entity_id: EntityId, producer_controller: ActorRef<ProducerControllerMessage<T>>) -> Self {
        Self {
            entity_id,
            producer_controller,
            next_to: None,
            buffered: VecDeque::new(),
            seq_nr: 0,
            unconfirmed: Vec::new(),
            last_used: Instant::now(),
        }
    }
}

struct AwaitingWrite<T> {
    seq_nr: SeqNr,
    envelope: ShardingEnvelope<T>,
    reply: Option<ConfirmationReply>,
}

/// State of a ShardingProducerController.
pub struct ShardingProducerState<T: Payload> {
    producer_id: ProducerId,
    settings: ShardingProducerControllerSettings,
    durable: Option<Arc<dyn DurableProducerQueue<T>>>,
    router: Arc<dyn EntityRouter<T>>,
    producer: Option<ActorRef<ShardingProducerSignal<T>>>,

    /// Next global seq nr.
    current_seq_nr: SeqNr,
    request_outstanding: bool,
    outs: HashMap<EntityId, OutState<T>>,

    awaiting_write: Option<AwaitingWrite<T>>,
    stash: VecDeque<ShardingProducerMessage<T>>,
    cleanup_timer: Option<TimerHandle>,
}

impl<T: Payload> ShardingProducerState<T> {
    fn buffered_total(&self) -> usize {
        self.outs
            .values()
            .fold(0usize, |total, out| total.saturating_add(out.buffered.len()))
    }

    fn has_capacity(&self) -> bool {
        self.buffered_total() < self.settings.buffer_size
    }

    fn stash_message(&mut self, message: ShardingProducerMessage<T>) -> Result<(), DeliveryError> {
        let capacity = self.settings.producer_controller.stash_capacity;
        if self.stash.len() >= capacity {
            return Err(DeliveryError::StashOverflow { capacity });
        }
        self.stash.push_back(message);
        Ok(())
    }

    fn request_next_signal(&self, myself: &ActorRef<ShardingProducerMessage<T>>) -> ShardingRequestNext<T> {
        let entities_with_demand: BTreeSet<EntityId> = self
            .outs
            .values()
            .filter(|out| out.next_to.is_some())
            .map(|out| out.entity_id.clone())
            .collect();
        let buffered_for_entities_without_demand: BTreeMap<EntityId, usize> = self
            .outs
            .values()
            .filter(|out| out.next_to.is_none() && !out.buffered.is_empty())
            .map(|out| (out.entity_id.clone(), out.buffered.len()))
            .collect();
        ShardingRequestNext {
            send_next_to: myself.clone(),
            entities_with_demand,
            buffered_for_entities_without_demand,
        }
    }

    fn snapshot(&self) -> ShardingProducerSnapshot {
        let entities = self
            .outs
            .values()
            .map(|out| {
                (out.entity_id.clone(), EntitySnapshot {
                    seq_nr: out.seq_nr,
                    buffered: out.buffered.len(),
                    unconfirmed: out.unconfirmed.iter().map(|s| s.total_seq_nr).collect(),
                    has_demand: out.next_to.is_some(),
                    producer_controller: out.producer_controller.get_id(),
                })
            })
            .collect();
        ShardingProducerSnapshot {
            producer_id: self.producer_id.clone(),
            current_seq_nr: self.current_seq_nr,
            requested: self.request_outstanding,
            entities,
            stashed: self.stash.len(),
            awaiting_write: self.awaiting_write.is_some(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ACTOR
// ═══════════════════════════════════════════════════════════════════════════

/// The ShardingProducerController actor definition.
pub struct ShardingProducerControllerActor<T>(PhantomData<fn() -> T>);

impl<T> ShardingProducerControllerActor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ShardingProducerControllerActor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments passed to the actor on startup.
pub struct ShardingProducerControllerArguments<T> {
    pub producer_id: ProducerId,
    pub settings: ShardingProducerControllerSettings,
    pub durable: Option<Arc<dyn DurableProducerQueue<T>>>,
    pub router: Arc<dyn EntityRouter<T>>,
    pub producer: Option<ActorRef<ShardingProducerSignal<T>>>,
}

impl<T: Payload> ShardingProducerControllerArguments<T> {
    pub fn new(producer_id: impl Into<ProducerId>, router: Arc<dyn EntityRouter<T>>) -> Self {
        Self {
            producer_id: producer_id.into(),
            settings: ShardingProducerControllerSettings::default(),
            durable: None,
            router,
            producer: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ShardingProducerControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_durable_queue(mut self, queue: Arc<dyn DurableProducerQueue<T>>) -> Self {
        self.durable = Some(queue);
        self
    }

    #[must_use]
    pub fn with_producer(mut self, producer: ActorRef<ShardingProducerSignal<T>>) -> Self {
        self.producer = Some(producer);
        self
    }
}

impl<T: Payload> Actor for ShardingProducerControllerActor<T> {
    type Msg = ShardingProducerMessage<T>;
    type State = ShardingProducerState<T>;
    type Arguments = ShardingProducerControllerArguments<T>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(
            producer_id = %args.producer_id,
            durable = args.durable.is_some(),
            buffer_size = args.settings.buffer_size,
            "ShardingProducerController starting"
        );

        let loaded = match &args.durable {
            Some(queue) => {
                let policy = RetryPolicy::from(&args.settings.producer_controller);
                let loaded = retry_with_backoff(policy, "load_state", || {
                    let queue = Arc::clone(queue);
                    async move { queue.load_state().await }
                })
                .await
                .map_err(|e| {
                    error!(producer_id = %args.producer_id, error = %e, "Failed to load durable state");
                    DeliveryError::from(e)
                })?;
                Some(loaded)
            }
            None => None,
        };

        let cleanup_after = args.settings.cleanup_unused_after;
        let mut state = ShardingProducerState {
            producer_id: args.producer_id,
            settings: args.settings,
            durable: args.durable,
            router: args.router,
            producer: args.producer,
            current_seq_nr: 1,
            request_outstanding: false,
            outs: HashMap::new(),
            awaiting_write: None,
            stash: VecDeque::new(),
            cleanup_timer: None,
        };

        if let Some(loaded) = loaded {
            state.current_seq_nr = loaded.current_seq_nr.max(1);
            let recovered = loaded.unconfirmed.len();
            let by_entity = loaded
                .unconfirmed
                .into_iter()
                .into_group_map_by(|sent| sent.confirmation_qualifier.clone());
            for (qualifier, sent) in by_entity {
                let entity_id = EntityId::new(qualifier);
                Self::spawn_out(&myself, &mut state, &entity_id).await?;
                if let Some(out) = state.outs.get_mut(&entity_id) {
                    out.buffered.extend(sent.into_iter().map(|sent| Buffered {
                        total_seq_nr: sent.seq_nr,
                        message: sent.message,
                        reply: None,
                    }));
                }
            }
            info!(
                producer_id = %state.producer_id,
                current_seq_nr = state.current_seq_nr,
                recovered,
                entities = state.outs.len(),
                "Recovered durable sharding producer state"
            );
        }

        state.cleanup_timer = start_periodic(myself.clone(), check_interval(cleanup_after), || {
            ShardingProducerMessage::CleanupUnused
        });
        Self::request_next(&myself, &mut state);
        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = &state.cleanup_timer {
            timer.stop();
        }
        for out in state.outs.values() {
            out.producer_controller.stop(Some("parent stopped".to_string()));
        }
        info!(
            producer_id = %state.producer_id,
            current_seq_nr = state.current_seq_nr,
            entities = state.outs.len(),
            "ShardingProducerController stopped"
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let mut result = Self::dispatch(&myself, message, state).await;
        if result.is_ok() {
            result = Self::replay_stash(&myself, state).await;
        }

        if let Err(e) = result {
            error!(producer_id = %state.producer_id, error = %e, "ShardingProducerController stopping");
            return Err(e.into());
        }
        Ok(())
    }
}

impl<T: Payload> ShardingProducerControllerActor<T> {
    async fn dispatch(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        message: ShardingProducerMessage<T>,
        state: &mut ShardingProducerState<T>,
    ) -> Result<(), DeliveryError> {
        if state.awaiting_write.is_some() {
            return match message {
                ShardingProducerMessage::StoreMessageSentCompleted { seq_nr } => {
                    Self::handle_store_completed(myself, state, seq_nr).await
                }
                ShardingProducerMessage::StoreMessageSentFailed { seq_nr, error } => {
                    Self::handle_store_failed(state, seq_nr, error)
                }
                ShardingProducerMessage::GetState { reply } => {
                    let _ = reply.send(state.snapshot());
                    Ok(())
                }
                other => state.stash_message(other),
            };
        }

        match message {
            ShardingProducerMessage::Start { producer } => {
                debug!(producer_id = %state.producer_id, "Producer registered");
                state.producer = Some(producer);
                state.request_outstanding = false;
                Self::request_next(myself, state);
                Ok(())
            }
            ShardingProducerMessage::Msg(envelope) => {
                Self::handle_msg(myself, state, envelope, None).await
            }
            ShardingProducerMessage::MessageWithConfirmation { envelope, reply_to } => {
                Self::handle_msg(myself, state, envelope, Some(reply_to)).await
            }
            ShardingProducerMessage::WrappedRequestNext { entity_id, next } => {
                Self::handle_wrapped_request_next(state, &entity_id, next);
                Self::request_next(myself, state);
                Ok(())
            }
            ShardingProducerMessage::EntityConfirmed {
                entity_id,
                confirmed_seq_nr,
            } => {
                Self::handle_entity_confirmed(state, &entity_id, confirmed_seq_nr);
                Ok(())
            }
            ShardingProducerMessage::CleanupUnused => {
                Self::handle_cleanup_unused(state);
                Self::request_next(myself, state);
                Ok(())
            }
            ShardingProducerMessage::ChildExited {
                entity_id,
                actor_id,
            } => Self::handle_child_exited(state, &entity_id, actor_id),
            ShardingProducerMessage::StoreMessageSentCompleted { seq_nr }
            | ShardingProducerMessage::StoreMessageSentFailed { seq_nr, .. } => {
                warn!(
                    producer_id = %state.producer_id,
                    seq_nr,
                    "Durable write completion without a write in flight"
                );
                Ok(())
            }
            ShardingProducerMessage::GetState { reply } => {
                let _ = reply.send(state.snapshot());
                Ok(())
            }
        }
    }

    async fn replay_stash(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
    ) -> Result<(), DeliveryError> {
        while state.awaiting_write.is_none() {
            let Some(message) = state.stash.pop_front() else {
                break;
            };
            Self::dispatch(myself, message, state).await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENTITIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Start the ProducerController for `entity_id` and watch it.
    async fn spawn_out(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
        entity_id: &EntityId,
    ) -> Result<(), DeliveryError> {
        let args = ProducerControllerArguments::new(state.producer_id.for_entity(entity_id))
            .with_settings(state.settings.producer_controller.clone())
            .with_link(ProducerLink::Sharded {
                entity_id: entity_id.clone(),
                controller: myself.clone(),
            })
            .with_destination(ConsumerDestination::Sharded {
                entity_id: entity_id.clone(),
                router: Arc::clone(&state.router),
            });

        let (child, handle) = Actor::spawn(None, ProducerControllerActor::new(), args)
            .await
            .map_err(|e| {
                DeliveryError::spawn_failed(format!(
                    "Failed to spawn ProducerController for entity {entity_id}: {e}"
                ))
            })?;

        let myself_clone = myself.clone();
        let exited = entity_id.clone();
        let actor_id = child.get_id();
        tokio::spawn(async move {
            let _ = handle.await;
            let _ = myself_clone.send_message(ShardingProducerMessage::ChildExited {
                entity_id: exited,
                actor_id,
            });
        });

        info!(
            producer_id = %state.producer_id,
            entity_id = %entity_id,
            producer_controller = %actor_id,
            "Started ProducerController for entity"
        );
        state
            .outs
            .insert(entity_id.clone(), OutState::new(entity_id.clone(), child));
        Ok(())
    }

    fn handle_child_exited(
        state: &mut ShardingProducerState<T>,
        entity_id: &EntityId,
        actor_id: ActorId,
    ) -> Result<(), DeliveryError> {
        let current = state
            .outs
            .get(entity_id)
            .is_some_and(|out| out.producer_controller.get_id() == actor_id);
        if !current {
            debug!(entity_id = %entity_id, actor = %actor_id, "Retired ProducerController exited");
            return Ok(());
        }
        error!(
            producer_id = %state.producer_id,
            entity_id = %entity_id,
            actor = %actor_id,
            "ProducerController for entity stopped unexpectedly"
        );
        Err(DeliveryError::ActorUnavailable)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SENDING
    // ═══════════════════════════════════════════════════════════════════════

    async fn handle_msg(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
        envelope: ShardingEnvelope<T>,
        reply: Option<ConfirmationReply>,
    ) -> Result<(), DeliveryError> {
        if !state.has_capacity() {
            let buffered = state.buffered_total();
            let capacity = state.settings.buffer_size;
            debug!(
                producer_id = %state.producer_id,
                entity_id = %envelope.entity_id,
                buffered,
                capacity,
                "Rejecting message, buffer full"
            );
            match (reply, &state.producer) {
                (Some(reply), _) => {
                    let _ = reply.send(Err(DeliveryError::Backpressure { buffered, capacity }));
                }
                (None, Some(producer)) => {
                    let _ = producer.send_message(ShardingProducerSignal::Backpressure {
                        envelope,
                        buffered,
                        capacity,
                    });
                }
                (None, None) => {}
            }
            return Ok(());
        }

        state.request_outstanding = false;
        let seq_nr = state.current_seq_nr;

        if let Some(queue) = state.durable.clone() {
            let sent = MessageSent::new(
                seq_nr,
                envelope.message.clone(),
                reply.is_some(),
                envelope.entity_id.qualifier(),
                timestamp_millis(),
            );
            let policy = RetryPolicy::from(&state.settings.producer_controller);
            Self::spawn_store_message_sent(myself, queue, policy, sent);
            debug!(producer_id = %state.producer_id, seq_nr, "Awaiting durable write");
            state.awaiting_write = Some(AwaitingWrite {
                seq_nr,
                envelope,
                reply,
            });
            return Ok(());
        }

        state.current_seq_nr = seq_nr.saturating_add(1);
        Self::route(myself, state, seq_nr, envelope, reply).await?;
        Self::request_next(myself, state);
        Ok(())
    }

    /// Buffer the message for its entity and release it if the entity has demand.
    async fn route(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
        total_seq_nr: SeqNr,
        envelope: ShardingEnvelope<T>,
        reply: Option<ConfirmationReply>,
    ) -> Result<(), DeliveryError> {
        let ShardingEnvelope { entity_id, message } = envelope;
        if !state.outs.contains_key(&entity_id) {
            Self::spawn_out(myself, state, &entity_id).await?;
        }
        let Some(out) = state.outs.get_mut(&entity_id) else {
            return Err(DeliveryError::protocol_violation(format!(
                "no outbound state for entity {entity_id}"
            )));
        };

        debug!(entity_id = %entity_id, seq_nr = total_seq_nr, "Routing message");
        out.last_used = Instant::now();
        out.buffered.push_back(Buffered {
            total_seq_nr,
            message,
            reply,
        });
        Self::release(out);
        Ok(())
    }

    /// Hand the oldest buffered message to the child if it asked for one.
    fn release(out: &mut OutState<T>) {
        let Some(next) = out.next_to.take() else {
            return;
        };
        let Some(buffered) = out.buffered.pop_front() else {
            out.next_to = Some(next);
            return;
        };

        let out_seq_nr = next.current_seq_nr;
        match next.send(buffered.message.clone()) {
            Ok(()) => {
                out.seq_nr = out_seq_nr;
                out.unconfirmed.push(Sent {
                    total_seq_nr: buffered.total_seq_nr,
                    out_seq_nr,
                    reply: buffered.reply,
                });
            }
            Err(e) => {
                warn!(entity_id = %out.entity_id, error = %e, "Entity ProducerController unreachable");
                out.buffered.push_front(buffered);
            }
        }
    }

    fn handle_wrapped_request_next(
        state: &mut ShardingProducerState<T>,
        entity_id: &EntityId,
        next: RequestNext<T>,
    ) {
        let Some(out) = state.outs.get_mut(entity_id) else {
            debug!(entity_id = %entity_id, "Demand from an evicted entity");
            return;
        };
        if out.producer_controller.get_id() != next.send_next_to.get_id() {
            debug!(entity_id = %entity_id, "Demand from a retired ProducerController");
            return;
        }
        out.next_to = Some(next);
        Self::release(out);
    }

    fn request_next(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
    ) {
        if state.request_outstanding || state.awaiting_write.is_some() || !state.has_capacity() {
            return;
        }
        let Some(producer) = &state.producer else {
            return;
        };
        let next = state.request_next_signal(myself);
        match producer.send_message(ShardingProducerSignal::RequestNext(next)) {
            Ok(()) => state.request_outstanding = true,
            Err(e) => warn!(producer_id = %state.producer_id, error = %e, "Producer unreachable"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONFIRMATION AND CLEANUP
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_entity_confirmed(
        state: &mut ShardingProducerState<T>,
        entity_id: &EntityId,
        confirmed_seq_nr: SeqNr,
    ) {
        let Some(out) = state.outs.get_mut(entity_id) else {
            return;
        };
        let (done, waiting): (Vec<Sent>, Vec<Sent>) = std::mem::take(&mut out.unconfirmed)
            .into_iter()
            .partition(|sent| sent.out_seq_nr <= confirmed_seq_nr);
        out.unconfirmed = waiting;

        let Some(highest) = done.iter().map(|sent| sent.total_seq_nr).max() else {
            return;
        };
        out.last_used = Instant::now();
        debug!(entity_id = %entity_id, confirmed_seq_nr, seq_nr = highest, "Entity confirmed");

        for sent in done {
            if let Some(reply) = sent.reply {
                let _ = reply.send(Ok(sent.total_seq_nr));
            }
        }

        if let Some(queue) = state.durable.clone() {
            let qualifier = entity_id.qualifier();
            let entity_id = entity_id.clone();
            tokio::spawn(async move {
                if let Err(e) = queue
                    .store_message_confirmed(highest, qualifier, timestamp_millis())
                    .await
                {
                    warn!(
                        entity_id = %entity_id,
                        seq_nr = highest,
                        error = %e,
                        "Failed to store confirmation, messages may be redelivered after restart"
                    );
                }
            });
        }
    }

    /// Retire entities that have been idle with nothing unconfirmed.
    fn handle_cleanup_unused(state: &mut ShardingProducerState<T>) {
        let idle_after = state.settings.cleanup_unused_after;
        let idle: Vec<EntityId> = state
            .outs
            .values()
            .filter(|out| out.unconfirmed.is_empty() && out.last_used.elapsed() >= idle_after)
            .map(|out| out.entity_id.clone())
            .collect();
        if idle.is_empty() {
            return;
        }

        let mut discarded: Vec<(ConfirmationQualifier, SeqNr)> = Vec::new();
        for entity_id in &idle {
            let Some(out) = state.outs.remove(entity_id) else {
                continue;
            };
            if !out.buffered.is_empty() {
                warn!(
                    producer_id = %state.producer_id,
                    entity_id = %entity_id,
                    discarded = out.buffered.len(),
                    "Discarding messages buffered for idle entity"
                );
            }
            let highest = out.buffered.iter().map(|b| b.total_seq_nr).max();
            for buffered in out.buffered {
                if let Some(reply) = buffered.reply {
                    let _ = reply.send(Err(DeliveryError::discarded(format!(
                        "entity {entity_id} was retired while idle"
                    ))));
                }
            }
            if let Some(highest) = highest {
                discarded.push((entity_id.qualifier(), highest));
            }

            info!(producer_id = %state.producer_id, entity_id = %entity_id, "Retiring idle entity");
            out.producer_controller.stop(Some("idle".to_string()));
        }

        if let Some(queue) = state.durable.clone() {
            let qualifiers: HashSet<ConfirmationQualifier> =
                idle.iter().map(EntityId::qualifier).collect();
            tokio::spawn(async move {
                for (qualifier, seq_nr) in discarded {
                    if let Err(e) = queue
                        .store_message_confirmed(seq_nr, qualifier.clone(), timestamp_millis())
                        .await
                    {
                        warn!(qualifier = %qualifier, seq_nr, error = %e, "Failed to record discarded messages");
                    }
                }
                if let Err(e) = queue.cleanup(qualifiers).await {
                    warn!(error = %e, "Durable queue cleanup failed");
                }
            });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DURABLE WRITES
    // ═══════════════════════════════════════════════════════════════════════

    fn spawn_store_message_sent(
        myself: &ActorRef<ShardingProducerMessage<T>>,
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
                Ok(()) => ShardingProducerMessage::StoreMessageSentCompleted { seq_nr },
                Err(error) => ShardingProducerMessage::StoreMessageSentFailed { seq_nr, error },
            };
            let _ = myself.send_message(outcome);
        });
    }

    async fn handle_store_completed(
        myself: &ActorRef<ShardingProducerMessage<T>>,
        state: &mut ShardingProducerState<T>,
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
        state.current_seq_nr = seq_nr.saturating_add(1);
        if let Some(reply) = write.reply {
            let _ = reply.send(Ok(seq_nr));
        }
        Self::route(myself, state, seq_nr, write.envelope, None).await?;
        Self::request_next(myself, state);
        Ok(())
    }

    fn handle_store_failed(
        state: &mut ShardingProducerState<T>,
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

/// Spawn a ShardingProducerController.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor could not start.
pub async fn spawn_sharding_producer_controller<T: Payload>(
    name: Option<String>,
    args: ShardingProducerControllerArguments<T>,
) -> Result<ActorRef<ShardingProducerMessage<T>>, DeliveryError> {
    let (actor_ref, _handle) = Actor::spawn(name, ShardingProducerControllerActor::new(), args)
        .await
        .map_err(|e| {
            DeliveryError::spawn_failed(format!("Failed to spawn ShardingProducerController: {e}"))
        })?;
    Ok(actor_ref)
}
