//! Identifiers, sequence numbers and timestamps shared by every controller.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequence number of a message within one producer's stream. Starts at 1.
pub type SeqNr = i64;

/// Epoch milliseconds.
pub type Timestamp = i64;

/// Distinguishes independent confirmation spaces that share one durable queue.
pub type ConfirmationQualifier = String;

/// Qualifier used by a producer that is not multiplexed over entities.
pub const NO_QUALIFIER: &str = "";

/// Anything that can travel through the delivery protocol.
pub trait Payload: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn timestamp_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a buffer size into a sequence-number window.
#[must_use]
pub fn window(buffer_size: usize) -> SeqNr {
    SeqNr::try_from(buffer_size).unwrap_or(SeqNr::MAX)
}

/// Identifies one logical producer stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(String);

impl ProducerId {
    /// Create a producer id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random producer id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Id of the per-entity child producer.
    #[must_use]
    pub fn for_entity(&self, entity_id: &EntityId) -> Self {
        Self(format!("{}-{}", self.0, entity_id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProducerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProducerId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Identifies a sharded entity (the logical destination of a message).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The durable-queue qualifier for this entity.
    #[must_use]
    pub fn qualifier(&self) -> ConfirmationQualifier {
        self.0.clone()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
