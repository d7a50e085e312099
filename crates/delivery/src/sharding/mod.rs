//! Delivery to sharded entities.
//!
//! A [`ShardingProducerController`](producer::ShardingProducerControllerActor)
//! fans one producer out to many entities through one ProducerController per
//! entity. On the receiving side a
//! [`ShardingConsumerController`](consumer::ShardingConsumerControllerActor)
//! runs one ConsumerController per producer for its entity.

mod consumer;
mod producer;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ractor::ActorRef;
use tracing::{debug, warn};

use crate::messages::ShardingConsumerMessage;
use crate::types::{EntityId, Payload};

pub use consumer::{
    ShardingConsumerControllerActor, ShardingConsumerControllerArguments, ShardingConsumerState,
    spawn_sharding_consumer_controller,
};
pub use producer::{
    ShardingProducerControllerActor, ShardingProducerControllerArguments, ShardingProducerState,
    spawn_sharding_producer_controller,
};

/// Resolves an entity id to the actor currently hosting it.
///
/// The answer may change between calls; controllers re-resolve before every
/// transmission.
pub trait EntityRouter<T>: Send + Sync {
    fn route(&self, entity_id: &EntityId) -> Option<ActorRef<ShardingConsumerMessage<T>>>;
}

/// In-memory entity directory for a single node.
///
/// Registering an entity again moves it, which looks like a rebalance to the
/// producers routing to it.
pub struct LocalEntityDirectory<T> {
    entities: Arc<RwLock<HashMap<EntityId, ActorRef<ShardingConsumerMessage<T>>>>>,
}

impl<T> Clone for LocalEntityDirectory<T> {
    fn clone(&self) -> Self {
        Self {
            entities: Arc::clone(&self.entities),
        }
    }
}

impl<T> Default for LocalEntityDirectory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalEntityDirectory<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Host `entity_id` at `entity`, replacing any previous host.
    pub fn register(&self, entity_id: impl Into<EntityId>, entity: ActorRef<ShardingConsumerMessage<T>>) {
        let entity_id = entity_id.into();
        match self.entities.write() {
            Ok(mut entities) => {
                debug!(entity_id = %entity_id, actor = %entity.get_id(), "Entity registered");
                entities.insert(entity_id, entity);
            }
            Err(_) => warn!(entity_id = %entity_id, "Entity directory lock poisoned"),
        }
    }

    pub fn unregister(&self, entity_id: &EntityId) {
        match self.entities.write() {
            Ok(mut entities) => {
                entities.remove(entity_id);
            }
            Err(_) => warn!(entity_id = %entity_id, "Entity directory lock poisoned"),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().map_or(0, |entities| entities.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Payload> EntityRouter<T> for LocalEntityDirectory<T> {
    fn route(&self, entity_id: &EntityId) -> Option<ActorRef<ShardingConsumerMessage<T>>> {
        self.entities
            .read()
            .ok()
            .and_then(|entities| entities.get(entity_id).cloned())
    }
}
