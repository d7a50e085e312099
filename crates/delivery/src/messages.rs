//! Protocol messages exchanged between producers, controllers and consumers.
//!
//! Every actor gets one exhaustive message enum. Replies travel back over
//! `RpcReplyPort`s carried inside the messages.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ractor::concurrency::oneshot;
use ractor::{ActorId, ActorRef, RpcReplyPort};
use tokio_util::sync::CancellationToken;

use crate::errors::{DeliveryError, DurableQueueError};
use crate::sharding::EntityRouter;
use crate::types::{EntityId, ProducerId, SeqNr};

/// Reply for an ask: the seq nr the message was assigned, once it is safe.
pub type ConfirmationReply = RpcReplyPort<Result<SeqNr, DeliveryError>>;

/// A message on the wire between a ProducerController and a ConsumerController.
#[derive(Debug, Clone)]
pub struct SequencedMessage<T> {
    pub producer_id: ProducerId,
    pub seq_nr: SeqNr,
    pub message: T,
    /// First message of a producer incarnation or after a destination change.
    pub first: bool,
    /// The producer wants an explicit `Ack` once this message is confirmed.
    pub ack: bool,
    pub producer_controller: ActorRef<ProducerControllerMessage<T>>,
}

/// A message handed to the application consumer.
///
/// The consumer must call [`Delivery::confirm`] once it has processed it; the
/// next message is held back until then.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub producer_id: ProducerId,
    pub seq_nr: SeqNr,
    pub message: T,
    pub confirm_to: ActorRef<ConsumerControllerMessage<T>>,
}

impl<T: Send + 'static> Delivery<T> {
    /// Tell the ConsumerController this message was processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller is gone.
    pub fn confirm(&self) -> Result<(), DeliveryError> {
        self.confirm_to
            .send_message(ConsumerControllerMessage::Confirmed)
            .map_err(DeliveryError::from)
    }
}

/// Demand signal from a ProducerController to its producer.
#[derive(Debug, Clone)]
pub struct RequestNext<T> {
    pub producer_id: ProducerId,
    pub current_seq_nr: SeqNr,
    pub confirmed_seq_nr: SeqNr,
    pub send_next_to: ActorRef<ProducerControllerMessage<T>>,
}

impl<T: Send + 'static> RequestNext<T> {
    /// Send the next message without waiting for confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the controller is gone.
    pub fn send(&self, message: T) -> Result<(), DeliveryError> {
        self.send_next_to
            .send_message(ProducerControllerMessage::Msg { message })
            .map_err(DeliveryError::from)
    }

    /// Send the next message and wait until it is stored (durable) or confirmed.
    ///
    /// Cancelling `cancel` abandons the wait only; the message stays in flight.
    ///
    /// # Errors
    ///
    /// Returns the controller's rejection, `AskCancelled`, or `ActorUnavailable`.
    pub async fn ask(&self, message: T, cancel: &CancellationToken) -> Result<SeqNr, DeliveryError> {
        let (tx, rx) = oneshot();
        self.send_next_to
            .send_message(ProducerControllerMessage::MessageWithConfirmation {
                message,
                reply_to: RpcReplyPort::from(tx),
            })
            .map_err(DeliveryError::from)?;
        await_confirmation(rx, cancel).await
    }
}

/// What a ProducerController tells its producer.
#[derive(Debug, Clone)]
pub enum ProducerSignal<T> {
    /// The controller can take one more message.
    RequestNext(RequestNext<T>),
    /// The message was rejected because the buffer is full.
    Backpressure {
        message: T,
        buffered: usize,
        capacity: usize,
    },
}

/// Where a ProducerController sends its demand signals.
#[derive(Debug, Clone)]
pub enum ProducerLink<T> {
    /// An application producer.
    Actor(ActorRef<ProducerSignal<T>>),
    /// The ShardingProducerController owning this per-entity child.
    Sharded {
        entity_id: EntityId,
        controller: ActorRef<ShardingProducerMessage<T>>,
    },
}

impl<T: Send + 'static> ProducerLink<T> {
    pub(crate) fn request_next(&self, next: RequestNext<T>) -> Result<(), DeliveryError> {
        match self {
            Self::Actor(producer) => producer
                .send_message(ProducerSignal::RequestNext(next))
                .map_err(DeliveryError::from),
            Self::Sharded {
                entity_id,
                controller,
            } => controller
                .send_message(ShardingProducerMessage::WrappedRequestNext {
                    entity_id: entity_id.clone(),
                    next,
                })
                .map_err(DeliveryError::from),
        }
    }

    pub(crate) fn confirmed(&self, confirmed_seq_nr: SeqNr) -> Result<(), DeliveryError> {
        match self {
            Self::Actor(_) => Ok(()),
            Self::Sharded {
                entity_id,
                controller,
            } => controller
                .send_message(ShardingProducerMessage::EntityConfirmed {
                    entity_id: entity_id.clone(),
                    confirmed_seq_nr,
                })
                .map_err(DeliveryError::from),
        }
    }
}

/// Where a ProducerController sends its `SequencedMessage`s.
#[derive(Clone)]
pub enum ConsumerDestination<T> {
    Direct(ActorRef<ConsumerControllerMessage<T>>),
    /// Resolved through the router before every transmission.
    Sharded {
        entity_id: EntityId,
        router: Arc<dyn EntityRouter<T>>,
    },
}

impl<T> std::fmt::Debug for ConsumerDestination<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(consumer) => f.debug_tuple("Direct").field(&consumer.get_id()).finish(),
            Self::Sharded { entity_id, .. } => f
                .debug_struct("Sharded")
                .field("entity_id", entity_id)
                .field("router", &"<EntityRouter>")
                .finish(),
        }
    }
}

impl<T: Send + 'static> ConsumerDestination<T> {
    /// The actor messages go to right now, if any.
    #[must_use]
    pub fn resolve(&self) -> Option<ResolvedDestination<T>> {
        match self {
            Self::Direct(consumer) => Some(ResolvedDestination::Consumer(consumer.clone())),
            Self::Sharded { entity_id, router } => {
                router.route(entity_id).map(ResolvedDestination::Entity)
            }
        }
    }
}

/// A concrete destination actor.
#[derive(Debug, Clone)]
pub enum ResolvedDestination<T> {
    Consumer(ActorRef<ConsumerControllerMessage<T>>),
    Entity(ActorRef<ShardingConsumerMessage<T>>),
}

impl<T: Send + 'static> ResolvedDestination<T> {
    #[must_use]
    pub fn id(&self) -> ActorId {
        match self {
            Self::Consumer(consumer) => consumer.get_id(),
            Self::Entity(entity) => entity.get_id(),
        }
    }

    pub(crate) fn send(&self, msg: SequencedMessage<T>) -> Result<(), DeliveryError> {
        match self {
            Self::Consumer(consumer) => consumer
                .send_message(ConsumerControllerMessage::Sequenced(msg))
                .map_err(DeliveryError::from),
            Self::Entity(entity) => entity
                .send_message(ShardingConsumerMessage::Sequenced(msg))
                .map_err(DeliveryError::from),
        }
    }
}

/// Messages handled by a ProducerController.
#[derive(Debug)]
pub enum ProducerControllerMessage<T> {
    /// Register the application producer.
    Start { producer: ActorRef<ProducerSignal<T>> },
    /// Register or change the destination ConsumerController.
    RegisterConsumer {
        consumer_controller: ActorRef<ConsumerControllerMessage<T>>,
    },
    Msg { message: T },
    MessageWithConfirmation {
        message: T,
        reply_to: ConfirmationReply,
    },
    /// Demand and confirmation from the consumer side.
    Request {
        confirmed_seq_nr: SeqNr,
        requested_seq_nr: SeqNr,
        support_resend: bool,
        via_timeout: bool,
    },
    Resend { from_seq_nr: SeqNr },
    Ack { confirmed_seq_nr: SeqNr },
    /// Timer tick.
    ResendFirstUnconfirmed,
    StoreMessageSentCompleted { seq_nr: SeqNr },
    StoreMessageSentFailed {
        seq_nr: SeqNr,
        error: DurableQueueError,
    },
    GetState { reply: RpcReplyPort<ProducerSnapshot> },
}

/// Messages handled by a ConsumerController.
#[derive(Debug)]
pub enum ConsumerControllerMessage<T> {
    /// Register the application consumer that receives `Delivery`s.
    Start { deliver_to: ActorRef<Delivery<T>> },
    RegisterToProducerController {
        producer_controller: ActorRef<ProducerControllerMessage<T>>,
    },
    Sequenced(SequencedMessage<T>),
    /// The application consumer finished the message in flight.
    Confirmed,
    DeliverThenStop,
    /// Timer tick.
    Retry,
    GetState { reply: RpcReplyPort<ConsumerSnapshot> },
}

/// A message addressed to a sharded entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingEnvelope<T> {
    pub entity_id: EntityId,
    pub message: T,
}

impl<T> ShardingEnvelope<T> {
    pub fn new(entity_id: impl Into<EntityId>, message: T) -> Self {
        Self {
            entity_id: entity_id.into(),
            message,
        }
    }
}

/// Demand signal from a ShardingProducerController to its producer.
#[derive(Debug, Clone)]
pub struct ShardingRequestNext<T> {
    pub send_next_to: ActorRef<ShardingProducerMessage<T>>,
    pub entities_with_demand: BTreeSet<EntityId>,
    pub buffered_for_entities_without_demand: BTreeMap<EntityId, usize>,
}

impl<T: Send + 'static> ShardingRequestNext<T> {
    /// # Errors
    ///
    /// Returns an error if the controller is gone.
    pub fn send(&self, envelope: ShardingEnvelope<T>) -> Result<(), DeliveryError> {
        self.send_next_to
            .send_message(ShardingProducerMessage::Msg(envelope))
            .map_err(DeliveryError::from)
    }

    /// Send and wait until the message is stored (durable) or confirmed by the entity.
    ///
    /// # Errors
    ///
    /// Returns the controller's rejection, `AskCancelled`, or `ActorUnavailable`.
    pub async fn ask(
        &self,
        envelope: ShardingEnvelope<T>,
        cancel: &CancellationToken,
    ) -> Result<SeqNr, DeliveryError> {
        let (tx, rx) = oneshot();
        self.send_next_to
            .send_message(ShardingProducerMessage::MessageWithConfirmation {
                envelope,
                reply_to: RpcReplyPort::from(tx),
            })
            .map_err(DeliveryError::from)?;
        await_confirmation(rx, cancel).await
    }
}

/// What a ShardingProducerController tells its producer.
#[derive(Debug, Clone)]
pub enum ShardingProducerSignal<T> {
    RequestNext(ShardingRequestNext<T>),
    Backpressure {
        envelope: ShardingEnvelope<T>,
        buffered: usize,
        capacity: usize,
    },
}

/// Messages handled by a ShardingProducerController.
#[derive(Debug)]
pub enum ShardingProducerMessage<T> {
    Start {
        producer: ActorRef<ShardingProducerSignal<T>>,
    },
    Msg(ShardingEnvelope<T>),
    MessageWithConfirmation {
        envelope: ShardingEnvelope<T>,
        reply_to: ConfirmationReply,
    },
    /// Demand from a per-entity child.
    WrappedRequestNext {
        entity_id: EntityId,
        next: RequestNext<T>,
    },
    /// Confirmation progress from a per-entity child.
    EntityConfirmed {
        entity_id: EntityId,
        confirmed_seq_nr: SeqNr,
    },
    /// Timer tick.
    CleanupUnused,
    /// A per-entity child stopped.
    ChildExited {
        entity_id: EntityId,
        actor_id: ActorId,
    },
    StoreMessageSentCompleted { seq_nr: SeqNr },
    StoreMessageSentFailed {
        seq_nr: SeqNr,
        error: DurableQueueError,
    },
    GetState {
        reply: RpcReplyPort<ShardingProducerSnapshot>,
    },
}

/// Messages handled by a ShardingConsumerController.
#[derive(Debug)]
pub enum ShardingConsumerMessage<T> {
    Sequenced(SequencedMessage<T>),
    /// A per-producer ConsumerController stopped.
    ChildExited {
        producer_id: ProducerId,
        actor_id: ActorId,
    },
    GetState {
        reply: RpcReplyPort<ShardingConsumerSnapshot>,
    },
}

/// Introspection view of a ProducerController.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSnapshot {
    pub producer_id: ProducerId,
    pub active: bool,
    pub current_seq_nr: SeqNr,
    pub confirmed_seq_nr: SeqNr,
    pub requested_seq_nr: SeqNr,
    pub first_seq_nr: SeqNr,
    pub unconfirmed: Vec<SeqNr>,
    pub pending: usize,
    pub stashed: usize,
    pub awaiting_write: bool,
    pub support_resend: bool,
}

/// Introspection view of a ConsumerController.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub producer_id: Option<ProducerId>,
    pub active: bool,
    pub expected_seq_nr: SeqNr,
    pub confirmed_seq_nr: SeqNr,
    pub requested_seq_nr: SeqNr,
    pub buffered: Vec<SeqNr>,
    pub in_flight: Option<SeqNr>,
    pub resend_requested: Option<SeqNr>,
}

/// Per-entity part of a [`ShardingProducerSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    /// Last seq nr handed to the entity's ProducerController.
    pub seq_nr: SeqNr,
    pub buffered: usize,
    pub unconfirmed: Vec<SeqNr>,
    pub has_demand: bool,
    pub producer_controller: ActorId,
}

/// Introspection view of a ShardingProducerController.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingProducerSnapshot {
    pub producer_id: ProducerId,
    pub current_seq_nr: SeqNr,
    pub requested: bool,
    pub entities: BTreeMap<EntityId, EntitySnapshot>,
    pub stashed: usize,
    pub awaiting_write: bool,
}

/// Introspection view of a ShardingConsumerController.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingConsumerSnapshot {
    pub entity_id: EntityId,
    pub producers: BTreeSet<ProducerId>,
}

async fn await_confirmation(
    rx: ractor::concurrency::OneshotReceiver<Result<SeqNr, DeliveryError>>,
    cancel: &CancellationToken,
) -> Result<SeqNr, DeliveryError> {
    tokio::select! {
        () = cancel.cancelled() => Err(DeliveryError::AskCancelled),
        reply = rx => reply.unwrap_or(Err(DeliveryError::ActorUnavailable)),
    }
}
