//! # tether-delivery
//!
//! Reliable, back-pressured, at-least-once delivery between actors.
//!
//! A [`ProducerController`](producer::ProducerControllerActor) and a
//! [`ConsumerController`](consumer::ConsumerControllerActor) sit between an
//! application producer and consumer. They number every message, only let the
//! producer send what the consumer asked for, drop duplicates and resend what
//! was lost. A [`DurableProducerQueue`](durable::DurableProducerQueue) lets a
//! restarted producer replay unconfirmed messages. The [`sharding`] module
//! multiplexes one producer over many entities.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod consumer;
pub mod durable;
pub mod errors;
pub mod messages;
pub mod producer;
pub mod retry;
pub mod settings;
pub mod sharding;
pub mod timers;
pub mod types;

pub use consumer::{ConsumerControllerActor, ConsumerControllerArguments, spawn_consumer_controller};
pub use durable::{DurableProducerQueue, DurableState, InMemoryDurableProducerQueue, MessageSent};
pub use errors::{DeliveryError, DurableQueueError};
pub use messages::{
    ConsumerControllerMessage, Delivery, ProducerControllerMessage, ProducerSignal, RequestNext,
    SequencedMessage, ShardingConsumerMessage, ShardingEnvelope, ShardingProducerMessage,
    ShardingProducerSignal, ShardingRequestNext,
};
pub use producer::{ProducerControllerActor, ProducerControllerArguments, spawn_producer_controller};
pub use settings::{
    ConsumerControllerSettings, DeliverySettings, ProducerControllerSettings,
    ShardingConsumerControllerSettings, ShardingProducerControllerSettings,
};
pub use sharding::{
    EntityRouter, LocalEntityDirectory, ShardingConsumerControllerArguments,
    ShardingProducerControllerArguments, spawn_sharding_consumer_controller,
    spawn_sharding_producer_controller,
};
pub use types::{EntityId, Payload, ProducerId, SeqNr};
