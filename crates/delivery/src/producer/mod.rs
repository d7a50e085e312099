//! Producer side of point-to-point delivery.

mod actor;
mod state;

use ractor::{Actor, ActorRef};

use crate::errors::DeliveryError;
use crate::messages::ProducerControllerMessage;
use crate::types::Payload;

pub use actor::{ProducerControllerActor, ProducerControllerArguments};
pub use state::ProducerState;

/// Spawn a ProducerController.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor could not start, for example because
/// the durable state could not be loaded.
pub async fn spawn_producer_controller<T: Payload>(
    name: Option<String>,
    args: ProducerControllerArguments<T>,
) -> Result<ActorRef<ProducerControllerMessage<T>>, DeliveryError> {
    let (actor_ref, _handle) = Actor::spawn(name, ProducerControllerActor::new(), args)
        .await
        .map_err(|e| {
            DeliveryError::spawn_failed(format!("Failed to spawn ProducerController: {e}"))
        })?;
    Ok(actor_ref)
}
