//! Delivery error types.
//!
//! `DeliveryError` doubles as the error returned in RPC replies (asks) and as
//! the reason a controller stops. `is_fatal` tells the two apart.

use thiserror::Error;

use crate::types::SeqNr;

/// Errors raised by a durable queue implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurableQueueError {
    /// The storage backend is temporarily unreachable.
    #[error("durable queue unavailable: {0}")]
    Unavailable(String),

    /// A write skipped ahead of the stored sequence.
    #[error("out-of-order write: expected seq nr {expected}, got {actual}")]
    OutOfOrder { expected: SeqNr, actual: SeqNr },

    /// Any other backend failure.
    #[error("durable queue internal error: {0}")]
    Internal(String),
}

impl DurableQueueError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Errors of the delivery protocol.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// A peer broke the protocol (for example sending beyond granted demand).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The consumer buffer would exceed its capacity.
    #[error("buffer overflow: {buffered} buffered, capacity {capacity}")]
    BufferOverflow { buffered: usize, capacity: usize },

    /// A gap stayed open with a full buffer for too long.
    #[error("gap before seq nr {missing} unresolved for {waited_ms} ms with a full buffer")]
    StalledGap { missing: SeqNr, waited_ms: u64 },

    /// The producer side has no room for another message.
    #[error("backpressure: {buffered} messages buffered, capacity {capacity}")]
    Backpressure { buffered: usize, capacity: usize },

    /// Durable queue write or load failed.
    #[error("durable queue failure: {0}")]
    DurableQueue(#[from] DurableQueueError),

    /// The message was dropped before it could be delivered.
    #[error("message discarded: {0}")]
    Discarded(String),

    /// The actor is not available (stopped or not started).
    #[error("actor not available")]
    ActorUnavailable,

    /// Channel communication error.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Failed to spawn an actor.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The caller cancelled its wait for a confirmation.
    #[error("ask cancelled by caller")]
    AskCancelled,

    /// Too many messages arrived while a durable write was in flight.
    #[error("stash overflow: capacity {capacity}")]
    StashOverflow { capacity: usize },

    /// Invalid or unreadable settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DeliveryError {
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn discarded(msg: impl Into<String>) -> Self {
        Self::Discarded(msg.into())
    }

    pub fn channel_error(msg: impl Into<String>) -> Self {
        Self::ChannelError(msg.into())
    }

    pub fn spawn_failed(msg: impl Into<String>) -> Self {
        Self::SpawnFailed(msg.into())
    }

    /// Whether this error stops the controller that raised it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation(_)
                | Self::BufferOverflow { .. }
                | Self::StalledGap { .. }
                | Self::DurableQueue(_)
                | Self::StashOverflow { .. }
        )
    }
}

impl From<tether_core::Error> for DeliveryError {
    fn from(e: tether_core::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl<M> From<ractor::MessagingErr<M>> for DeliveryError {
    fn from(e: ractor::MessagingErr<M>) -> Self {
        match e {
            ractor::MessagingErr::SendErr(_) | ractor::MessagingErr::ChannelClosed => {
                Self::ActorUnavailable
            }
            _ => Self::channel_error("invalid actor type"),
        }
    }
}
