//! Admin client for topic, broker and consumer group management

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::RDKafkaErrorCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Span};

use crate::client::{cancellable, AdminClient, ClientSlot, ItemResult};
use crate::config::AdminConfig;
use crate::connection;
use crate::error::KafkaClientError;
use crate::logger;
use crate::Result;

/// Topic to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub partitions: i32,
    /// -1 uses the broker default
    pub replication_factor: i16,
    /// Topic-level settings such as `cleanup.policy`
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
}

impl TopicConfig {
    pub fn new<S: Into<String>>(name: S, partitions: i32, replication_factor: i16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
            configs: BTreeMap::new(),
        }
    }

    pub fn with_config<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }
}

/// Topic as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

/// Consumer group as reported by its coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub state: String,
    pub protocol_type: String,
    pub protocol: String,
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: String,
    pub client_id: String,
    pub client_host: String,
}

/// Admin client for cluster management
pub struct Admin {
    config: Arc<AdminConfig>,
    slot: ClientSlot<dyn AdminClient>,
    span: Span,
}

impl Admin {
    /// Connect to the cluster described by `config`
    pub async fn new(config: AdminConfig) -> Result<Self> {
        config.validate()?;
        let client = connection::connect_admin(&config).await?;
        Self::with_client(config, client)
    }

    /// Admin over an existing backend
    pub fn with_client(config: AdminConfig, client: Arc<dyn AdminClient>) -> Result<Self> {
        Self::build(config, client, None)
    }

    fn build(config: AdminConfig, client: Arc<dyn AdminClient>, parent: Option<&Span>) -> Result<Self> {
        config.validate()?;
        let span = logger::admin_span(parent, &config.base.brokers);
        info!(parent: &span, "Admin client connected");
        Ok(Self {
            config: Arc::new(config),
            slot: ClientSlot::new(client),
            span,
        })
    }

    pub fn builder() -> AdminBuilder {
        AdminBuilder::default()
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    /// Create topics; the first topic the cluster rejects is returned as the error
    pub async fn create_topics(&self, token: &CancellationToken, topics: &[TopicConfig]) -> Result<()> {
        let client = self.slot.snapshot()?;
        let results = cancellable(token, client.create_topics(topics)).await?;
        self.first_failure("create topic", results)?;
        info!(parent: &self.span, count = topics.len(), "Created topics");
        Ok(())
    }

    pub async fn delete_topics<I, S>(&self, token: &CancellationToken, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let client = self.slot.snapshot()?;
        let results = cancellable(token, client.delete_topics(&topics)).await?;
        self.first_failure("delete topic", results)?;
        info!(parent: &self.span, topics = %topics.join(","), "Deleted topics");
        Ok(())
    }

    /// Every topic with its partitions and replicas, sorted by name.
    ///
    /// Internal topics (`__consumer_offsets`, `__transaction_state`, ...) are
    /// left out.
    pub async fn list_topics(&self, token: &CancellationToken) -> Result<Vec<TopicInfo>> {
        let client = self.slot.snapshot()?;
        let metadata = cancellable(token, client.metadata(&[])).await?;
        let mut topics: Vec<TopicInfo> = metadata.topics.into_iter().filter(|topic| !topic.internal).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    /// Describe `topics`; a topic the cluster does not know is an error
    pub async fn describe_topics<I, S>(&self, token: &CancellationToken, topics: I) -> Result<Vec<TopicInfo>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let client = self.slot.snapshot()?;
        let metadata = cancellable(token, client.metadata(&topics)).await?;
        if let Some((topic, code)) = metadata.missing.into_iter().next() {
            error!(parent: &self.span, kafka_topic = %topic, error = %code, "Failed to describe topic");
            return Err(KafkaClientError::from_code(code));
        }
        Ok(metadata.topics)
    }

    pub async fn topic_exists(&self, token: &CancellationToken, topic: &str) -> Result<bool> {
        let client = self.slot.snapshot()?;
        let metadata = cancellable(token, client.metadata(&[topic.to_string()])).await?;
        match metadata.missing.into_iter().next() {
            None => Ok(metadata.topics.iter().any(|t| t.name == topic)),
            Some((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => Ok(false),
            Some((_, code)) => Err(KafkaClientError::from_code(code)),
        }
    }

    pub async fn list_brokers(&self, token: &CancellationToken) -> Result<Vec<BrokerInfo>> {
        let client = self.slot.snapshot()?;
        let metadata = cancellable(token, client.metadata(&[])).await?;
        Ok(metadata.brokers)
    }

    /// Names of all consumer groups, sorted
    pub async fn list_groups(&self, token: &CancellationToken) -> Result<Vec<String>> {
        let client = self.slot.snapshot()?;
        let groups = cancellable(token, client.list_groups()).await?;
        let mut names: Vec<String> = groups.into_iter().map(|group| group.name).collect();
        names.sort();
        Ok(names)
    }

    pub async fn describe_groups<I, S>(&self, token: &CancellationToken, groups: I) -> Result<Vec<GroupInfo>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: Vec<String> = groups.into_iter().map(Into::into).collect();
        let client = self.slot.snapshot()?;
        cancellable(token, client.describe_groups(&groups)).await
    }

    pub async fn delete_groups<I, S>(&self, token: &CancellationToken, groups: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: Vec<String> = groups.into_iter().map(Into::into).collect();
        let client = self.slot.snapshot()?;
        info!(parent: &self.span, groups = %groups.join(","), "Deleting consumer groups");
        let results = cancellable(token, client.delete_groups(&groups)).await?;
        self.first_failure("delete group", results)
    }

    /// Close the admin client. Further calls are no-ops.
    pub async fn close(&self) {
        if let Some(client) = self.slot.take() {
            client.close().await;
            info!(parent: &self.span, "Admin client closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    fn first_failure(&self, operation: &str, results: Vec<ItemResult>) -> Result<()> {
        match results.into_iter().find_map(|item| item.error.map(|err| (item.name, err))) {
            Some((name, err)) => {
                error!(parent: &self.span, item = %name, error = %err, "Failed to {}", operation);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Builder for [`Admin`]
#[derive(Default)]
pub struct AdminBuilder {
    config: AdminConfig,
    parent: Option<Span>,
    client: Option<Arc<dyn AdminClient>>,
}

impl AdminBuilder {
    /// Start from an existing configuration
    pub fn config(mut self, config: AdminConfig) -> Self {
        self.config = config;
        self
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.base.brokers = brokers
            .into_iter()
            .map(|b| b.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.base.client_id = client_id.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.base.request_timeout = timeout;
        self
    }

    /// Parent span for the client's log events
    pub fn span(mut self, parent: Span) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Use `client` instead of connecting with librdkafka
    pub fn client(mut self, client: Arc<dyn AdminClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn build(self) -> Result<Admin> {
        let client = match self.client {
            Some(client) => client,
            None => {
                self.config.validate()?;
                connection::connect_admin(&self.config).await?
            }
        };
        Admin::build(self.config, client, self.parent.as_ref())
    }
}
