//! Controller settings.
//!
//! Every field has a default, so a settings file only needs to name what it
//! overrides. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::Error;
use tether_core::config::{load_config_file, path_from_env};
use tracing::info;

/// Environment variable naming a settings file.
pub const CONFIG_ENV_VAR: &str = "TETHER_DELIVERY_CONFIG";

/// Settings for a `ProducerController`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerControllerSettings {
    /// Upper bound for unconfirmed plus pending messages.
    #[serde(default = "default_producer_buffer_size")]
    pub buffer_size: usize,

    /// How long the oldest unconfirmed message may wait before it is re-sent.
    #[serde(
        with = "duration_ms",
        default = "default_resend_first_unconfirmed_idle_timeout"
    )]
    pub resend_first_unconfirmed_idle_timeout: Duration,

    /// Attempts for each durable `MessageSent` write.
    #[serde(default = "default_durable_queue_retry_attempts")]
    pub durable_queue_retry_attempts: u32,

    #[serde(default = "default_durable_queue_backoff_base_ms")]
    pub durable_queue_backoff_base_ms: u64,

    #[serde(default = "default_durable_queue_backoff_max_ms")]
    pub durable_queue_backoff_max_ms: u64,

    /// Messages held while a durable write is in flight.
    #[serde(default = "default_stash_capacity")]
    pub stash_capacity: usize,
}

impl Default for ProducerControllerSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_producer_buffer_size(),
            resend_first_unconfirmed_idle_timeout: default_resend_first_unconfirmed_idle_timeout(),
            durable_queue_retry_attempts: default_durable_queue_retry_attempts(),
            durable_queue_backoff_base_ms: default_durable_queue_backoff_base_ms(),
            durable_queue_backoff_max_ms: default_durable_queue_backoff_max_ms(),
            stash_capacity: default_stash_capacity(),
        }
    }
}

impl ProducerControllerSettings {
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub fn with_resend_first_unconfirmed_idle_timeout(mut self, timeout: Duration) -> Self {
        self.resend_first_unconfirmed_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_durable_retry(mut self, attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        self.durable_queue_retry_attempts = attempts;
        self.durable_queue_backoff_base_ms = base_ms;
        self.durable_queue_backoff_max_ms = max_ms;
        self
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> tether_core::Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("producer buffer_size must be > 0"));
        }
        if self.durable_queue_retry_attempts == 0 {
            return Err(Error::invalid_config(
                "durable_queue_retry_attempts must be > 0",
            ));
        }
        if self.durable_queue_backoff_base_ms > self.durable_queue_backoff_max_ms {
            return Err(Error::invalid_config(
                "durable_queue_backoff_base_ms must not exceed durable_queue_backoff_max_ms",
            ));
        }
        if self.stash_capacity == 0 {
            return Err(Error::invalid_config("stash_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Settings for a `ConsumerController`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerControllerSettings {
    /// Flow-control window granted to the producer.
    #[serde(default = "default_consumer_buffer_size")]
    pub buffer_size: usize,

    /// Period of the retry timer (resends, idle requests, registration).
    #[serde(with = "duration_ms", default = "default_resend_interval")]
    pub resend_interval: Duration,

    /// How long a gap may stay open with a full buffer.
    #[serde(with = "duration_ms", default = "default_gap_timeout")]
    pub gap_timeout: Duration,

    /// Only grant demand; never ask for resends.
    #[serde(default)]
    pub only_flow_control: bool,
}

impl Default for ConsumerControllerSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_consumer_buffer_size(),
            resend_interval: default_resend_interval(),
            gap_timeout: default_gap_timeout(),
            only_flow_control: false,
        }
    }
}

impl ConsumerControllerSettings {
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    #[must_use]
    pub fn with_gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_only_flow_control(mut self, only_flow_control: bool) -> Self {
        self.only_flow_control = only_flow_control;
        self
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> tether_core::Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("consumer buffer_size must be > 0"));
        }
        if self.resend_interval.is_zero() {
            return Err(Error::invalid_config("resend_interval must be > 0"));
        }
        Ok(())
    }
}

/// Settings for a `ShardingProducerController`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingProducerControllerSettings {
    /// Upper bound for messages buffered across all entities without demand.
    #[serde(default = "default_producer_buffer_size")]
    pub buffer_size: usize,

    /// Idle time after which an entity without unconfirmed messages is evicted.
    #[serde(with = "duration_ms", default = "default_cleanup_unused_after")]
    pub cleanup_unused_after: Duration,

    /// Settings of the per-entity child producers.
    #[serde(default)]
    pub producer_controller: ProducerControllerSettings,
}

impl Default for ShardingProducerControllerSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_producer_buffer_size(),
            cleanup_unused_after: default_cleanup_unused_after(),
            producer_controller: ProducerControllerSettings::default(),
        }
    }
}

impl ShardingProducerControllerSettings {
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub fn with_cleanup_unused_after(mut self, after: Duration) -> Self {
        self.cleanup_unused_after = after;
        self
    }

    #[must_use]
    pub fn with_producer_controller(mut self, settings: ProducerControllerSettings) -> Self {
        self.producer_controller = settings;
        self
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> tether_core::Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid_config(
                "sharding producer buffer_size must be > 0",
            ));
        }
        self.producer_controller.validate()
    }
}

/// Settings for a `ShardingConsumerController`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConsumerControllerSettings {
    #[serde(default)]
    pub consumer_controller: ConsumerControllerSettings,
}

impl ShardingConsumerControllerSettings {
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> tether_core::Result<()> {
        self.consumer_controller.validate()
    }
}

/// All delivery settings, as read from a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySettings {
    #[serde(default)]
    pub producer_controller: ProducerControllerSettings,
    #[serde(default)]
    pub consumer_controller: ConsumerControllerSettings,
    #[serde(default)]
    pub sharding_producer_controller: ShardingProducerControllerSettings,
    #[serde(default)]
    pub sharding_consumer_controller: ShardingConsumerControllerSettings,
}

impl DeliverySettings {
    /// Load and validate settings from a TOML or JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a value is invalid.
    pub fn load(path: &Path) -> tether_core::Result<Self> {
        let settings: Self = load_config_file(path)?;
        settings.validate()?;
        info!(path = %path.display(), "Loaded delivery settings");
        Ok(settings)
    }

    /// Load from the file named by `TETHER_DELIVERY_CONFIG`, or fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable names a file that cannot be loaded.
    pub fn from_env_or_default() -> tether_core::Result<Self> {
        match path_from_env(CONFIG_ENV_VAR) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> tether_core::Result<()> {
        self.producer_controller.validate()?;
        self.consumer_controller.validate()?;
        self.sharding_producer_controller.validate()?;
        self.sharding_consumer_controller.validate()
    }
}

const fn default_producer_buffer_size() -> usize {
    1000
}

const fn default_resend_first_unconfirmed_idle_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_durable_queue_retry_attempts() -> u32 {
    10
}

const fn default_durable_queue_backoff_base_ms() -> u64 {
    100
}

const fn default_durable_queue_backoff_max_ms() -> u64 {
    3200
}

const fn default_stash_capacity() -> usize {
    1000
}

const fn default_consumer_buffer_size() -> usize {
    50
}

const fn default_resend_interval() -> Duration {
    Duration::from_secs(2)
}

const fn default_gap_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_cleanup_unused_after() -> Duration {
    Duration::from_secs(120)
}

/// Serialization helper for Duration as milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
