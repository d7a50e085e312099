//! Consumer side of point-to-point delivery.

mod actor;
mod state;

use ractor::{Actor, ActorRef};

use crate::errors::DeliveryError;
use crate::messages::ConsumerControllerMessage;
use crate::types::Payload;

pub use actor::{ConsumerControllerActor, ConsumerControllerArguments};
pub use state::ConsumerState;

/// Spawn a ConsumerController.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor could not start.
pub async fn spawn_consumer_controller<T: Payload>(
    name: Option<String>,
    args: ConsumerControllerArguments<T>,
) -> Result<ActorRef<ConsumerControllerMessage<T>>, DeliveryError> {
    let (actor_ref, _handle) = Actor::spawn(name, ConsumerControllerActor::new(), args)
        .await
        .map_err(|e| {
            DeliveryError::spawn_failed(format!("Failed to spawn ConsumerController: {e}"))
        })?;
    Ok(actor_ref)
}
