use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::config::ClientConfig;

use crate::diagnostics::Diagnostics;
use crate::error::ConsumerError;
use crate::types::{AutoOffsetReset, OffsetRetrieval};

/// Consumer configuration.
///
/// Built programmatically via the `with_*` methods or from the environment
/// via [`ConsumerSettingsFromEnv`]. `properties` are forwarded verbatim to
/// the client and win over everything the builder sets.
#[derive(Clone)]
pub struct ConsumerSettings {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: Option<String>,
    /// Bound for releasing the client, and the graceful-shutdown deadline.
    pub close_timeout: Duration,
    /// Pacing of runloop ticks; polls happen at most this often.
    pub poll_interval: Duration,
    /// How long one poll may wait for the first record.
    pub poll_timeout: Duration,
    /// Chunk backlog at which a partition is paused.
    pub partition_chunk_prefetch: usize,
    /// Upper bound on records drained from the client per poll.
    pub max_poll_records: usize,
    pub offset_retrieval: OffsetRetrieval,
    pub properties: HashMap<String, String>,
    pub diagnostics: Diagnostics,
}

impl ConsumerSettings {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            client_id: None,
            close_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            partition_chunk_prefetch: 4,
            max_poll_records: 500,
            offset_retrieval: OffsetRetrieval::default(),
            properties: HashMap::new(),
            diagnostics: Diagnostics::disabled(),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// How many chunks a partition queue may hold before the partition is
    /// paused. Clamped to at least one.
    pub fn with_partition_chunk_prefetch(mut self, prefetch: usize) -> Self {
        self.partition_chunk_prefetch = prefetch.max(1);
        self
    }

    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    pub fn with_offset_retrieval(mut self, retrieval: OffsetRetrieval) -> Self {
        self.offset_retrieval = retrieval;
        self
    }

    /// Forward an arbitrary client property verbatim.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Assemble the rdkafka client configuration.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            // Commits are driven exclusively by the runloop.
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        let reset = match &self.offset_retrieval {
            OffsetRetrieval::Auto(reset) => reset.as_config_value(),
            // With a manual resolver the broker must not silently pick a
            // position on its own.
            OffsetRetrieval::Manual(_) => AutoOffsetReset::None.as_config_value(),
        };
        config.set("auto.offset.reset", reset);

        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }

        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

impl fmt::Debug for ConsumerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSettings")
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("group_id", &self.group_id)
            .field("client_id", &self.client_id)
            .field("close_timeout", &self.close_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("partition_chunk_prefetch", &self.partition_chunk_prefetch)
            .field("max_poll_records", &self.max_poll_records)
            .field("offset_retrieval", &self.offset_retrieval)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Environment-variable configuration, millisecond-denominated where the
/// settings use durations.
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerSettingsFromEnv {
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP")]
    pub kafka_consumer_group: String,

    // Supplied by the deploy environment, used for sticky client ids.
    #[envconfig(from = "KAFKA_CLIENT_ID")]
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "10000")]
    pub close_timeout_ms: u64,

    #[envconfig(default = "50")]
    pub poll_interval_ms: u64,

    #[envconfig(default = "50")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "4")]
    pub partition_chunk_prefetch: usize,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "latest")]
    pub auto_offset_reset: String,
}

impl ConsumerSettingsFromEnv {
    pub fn into_settings(self) -> Result<ConsumerSettings, ConsumerError> {
        let reset = AutoOffsetReset::parse(&self.auto_offset_reset)?;
        let mut settings = ConsumerSettings::new(self.kafka_hosts, self.kafka_consumer_group)
            .with_close_timeout(Duration::from_millis(self.close_timeout_ms))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
            .with_partition_chunk_prefetch(self.partition_chunk_prefetch)
            .with_max_poll_records(self.max_poll_records)
            .with_offset_retrieval(OffsetRetrieval::Auto(reset));
        settings.client_id = self.kafka_client_id;
        Ok(settings)
    }
}
