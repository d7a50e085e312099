//! ShardingConsumerController actor.
//!
//! One per entity. Keeps a ConsumerController for every producer that sends
//! to the entity, all delivering to the same consumer actor.

use std::collections::HashMap;
use std::marker::PhantomData;

use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef};
use tracing::{debug, info, warn};

use crate::consumer::{ConsumerControllerActor, ConsumerControllerArguments};
use crate::errors::DeliveryError;
use crate::messages::{
    ConsumerControllerMessage, Delivery, SequencedMessage, ShardingConsumerMessage,
    ShardingConsumerSnapshot,
};
use crate::settings::ShardingConsumerControllerSettings;
use crate::types::{EntityId, Payload, ProducerId};

/// The ShardingConsumerController actor definition.
pub struct ShardingConsumerControllerActor<T>(PhantomData<fn() -> T>);

impl<T> ShardingConsumerControllerActor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ShardingConsumerControllerActor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments passed to the actor on startup.
pub struct ShardingConsumerControllerArguments<T> {
    pub entity_id: EntityId,
    pub deliver_to: ActorRef<Delivery<T>>,
    pub settings: ShardingConsumerControllerSettings,
}

impl<T> ShardingConsumerControllerArguments<T> {
    pub fn new(entity_id: impl Into<EntityId>, deliver_to: ActorRef<Delivery<T>>) -> Self {
        Self {
            entity_id: entity_id.into(),
            deliver_to,
            settings: ShardingConsumerControllerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ShardingConsumerControllerSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// State of a ShardingConsumerController.
pub struct ShardingConsumerState<T> {
    entity_id: EntityId,
    deliver_to: ActorRef<Delivery<T>>,
    settings: ShardingConsumerControllerSettings,
    controllers: HashMap<ProducerId, ActorRef<ConsumerControllerMessage<T>>>,
}

impl<T: Payload> Actor for ShardingConsumerControllerActor<T> {
    type Msg = ShardingConsumerMessage<T>;
    type State = ShardingConsumerState<T>;
    type Arguments = ShardingConsumerControllerArguments<T>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        info!(entity_id = %args.entity_id, "ShardingConsumerController starting");
        Ok(ShardingConsumerState {
            entity_id: args.entity_id,
            deliver_to: args.deliver_to,
            settings: args.settings,
            controllers: HashMap::new(),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for controller in state.controllers.values() {
            controller.stop(Some("entity stopped".to_string()));
        }
        info!(entity_id = %state.entity_id, "ShardingConsumerController stopped");
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ShardingConsumerMessage::Sequenced(msg) => {
                Self::handle_sequenced(&myself, state, msg).await?;
            }
            ShardingConsumerMessage::ChildExited {
                producer_id,
                actor_id,
            } => Self::handle_child_exited(state, &producer_id, actor_id),
            ShardingConsumerMessage::GetState { reply } => {
                let _ = reply.send(ShardingConsumerSnapshot {
                    entity_id: state.entity_id.clone(),
                    producers: state.controllers.keys().cloned().collect(),
                });
            }
        }
        Ok(())
    }
}

impl<T: Payload> ShardingConsumerControllerActor<T> {
    async fn handle_sequenced(
        myself: &ActorRef<ShardingConsumerMessage<T>>,
        state: &mut ShardingConsumerState<T>,
        msg: SequencedMessage<T>,
    ) -> Result<(), DeliveryError> {
        let controller = match state.controllers.get(&msg.producer_id) {
            Some(controller) => controller.clone(),
            None => Self::spawn_controller(myself, state, &msg.producer_id).await?,
        };

        if let Err(e) = controller.send_message(ConsumerControllerMessage::Sequenced(msg)) {
            debug!(entity_id = %state.entity_id, error = %e, "ConsumerController gone, message dropped");
        }
        Ok(())
    }

    async fn spawn_controller(
        myself: &ActorRef<ShardingConsumerMessage<T>>,
        state: &mut ShardingConsumerState<T>,
        producer_id: &ProducerId,
    ) -> Result<ActorRef<ConsumerControllerMessage<T>>, DeliveryError> {
        let args = ConsumerControllerArguments::new()
            .with_settings(state.settings.consumer_controller.clone())
            .with_consumer(state.deliver_to.clone());

        let (controller, handle) = Actor::spawn(None, ConsumerControllerActor::new(), args)
            .await
            .map_err(|e| {
                DeliveryError::spawn_failed(format!(
                    "Failed to spawn ConsumerController for producer {producer_id}: {e}"
                ))
            })?;

        let myself_clone = myself.clone();
        let exited = producer_id.clone();
        let actor_id = controller.get_id();
        tokio::spawn(async move {
            let _ = handle.await;
            let _ = myself_clone.send_message(ShardingConsumerMessage::ChildExited {
                producer_id: exited,
                actor_id,
            });
        });

        info!(
            entity_id = %state.entity_id,
            producer_id = %producer_id,
            consumer_controller = %actor_id,
            "Started ConsumerController for producer"
        );
        state
            .controllers
            .insert(producer_id.clone(), controller.clone());
        Ok(controller)
    }

    fn handle_child_exited(
        state: &mut ShardingConsumerState<T>,
        producer_id: &ProducerId,
        actor_id: ActorId,
    ) {
        let current = state
            .controllers
            .get(producer_id)
            .is_some_and(|controller| controller.get_id() == actor_id);
        if current {
            warn!(
                entity_id = %state.entity_id,
                producer_id = %producer_id,
                "ConsumerController stopped, next message starts a fresh one"
            );
            state.controllers.remove(producer_id);
        }
    }
}

/// Spawn a ShardingConsumerController.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor could not start.
pub async fn spawn_sharding_consumer_controller<T: Payload>(
    name: Option<String>,
    args: ShardingConsumerControllerArguments<T>,
) -> Result<ActorRef<ShardingConsumerMessage<T>>, DeliveryError> {
    let (actor_ref, _handle) = Actor::spawn(name, ShardingConsumerControllerActor::new(), args)
        .await
        .map_err(|e| {
            DeliveryError::spawn_failed(format!(
                "Failed to spawn ShardingConsumerController: {e}"
            ))
        })?;
    Ok(actor_ref)
}
