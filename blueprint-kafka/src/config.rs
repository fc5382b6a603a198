//! Configuration types for the Kafka clients
//!
//! Configs are plain serde structs with defaults. They are validated and
//! translated into librdkafka properties once, when a client is built.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::credential::CredentialConfig;
use crate::error::KafkaClientError;
use crate::Result;

/// Default `client.id` reported to brokers
pub const DEFAULT_CLIENT_ID: &str = "blueprint-kafka";

/// Serde helper storing a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

/// SASL / token authentication mechanism
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum AuthType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "scram-256")]
    Scram256,
    #[serde(rename = "scram-512")]
    Scram512,
    #[serde(rename = "aws-msk-iam")]
    AwsMskIam,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Plain => "plain",
            Self::Scram256 => "scram-256",
            Self::Scram512 => "scram-512",
            Self::AwsMskIam => "aws-msk-iam",
            Self::OAuth => "oauth",
        }
    }

    /// The `sasl.mechanism` librdkafka expects, if SASL is used at all
    pub fn sasl_mechanism(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Plain => Some("PLAIN"),
            Self::Scram256 => Some("SCRAM-SHA-256"),
            Self::Scram512 => Some("SCRAM-SHA-512"),
            Self::AwsMskIam | Self::OAuth => Some("OAUTHBEARER"),
        }
    }
}

impl FromStr for AuthType {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "plain" => Ok(Self::Plain),
            "scram-256" | "scram256" | "scram-sha-256" => Ok(Self::Scram256),
            "scram-512" | "scram512" | "scram-sha-512" => Ok(Self::Scram512),
            "aws-msk-iam" => Ok(Self::AwsMskIam),
            "oauth" | "oauthbearer" => Ok(Self::OAuth),
            _ => Err(KafkaClientError::InvalidAuthType(s.to_string())),
        }
    }
}

/// Durability demanded from the broker on produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Acks {
    /// Fire and forget
    #[serde(rename = "none")]
    None,
    /// Leader has written the record
    #[default]
    #[serde(rename = "leader")]
    Leader,
    /// All in-sync replicas have written the record
    #[serde(rename = "all")]
    All,
}

impl Acks {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Leader => "leader",
            Self::All => "all",
        }
    }

    fn property(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

impl FromStr for Acks {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "" | "leader" | "one" | "1" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            _ => Err(KafkaClientError::InvalidAcks(s.to_string())),
        }
    }
}

/// Producer compression codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(KafkaClientError::InvalidCompression(s.to_string())),
        }
    }
}

/// Where a consumer starts when it has no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

impl StartOffset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for StartOffset {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "start" | "beginning" => Ok(Self::Earliest),
            "" | "latest" | "end" => Ok(Self::Latest),
            _ => Err(KafkaClientError::InvalidOffset(s.to_string())),
        }
    }
}

/// Visibility of transactional records to a consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum IsolationLevel {
    #[serde(rename = "read-uncommitted")]
    ReadUncommitted,
    #[default]
    #[serde(rename = "read-committed")]
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read-uncommitted",
            Self::ReadCommitted => "read-committed",
        }
    }

    fn property(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-uncommitted" | "read_uncommitted" | "uncommitted" => Ok(Self::ReadUncommitted),
            "" | "read-committed" | "read_committed" | "committed" => Ok(Self::ReadCommitted),
            _ => Err(KafkaClientError::InvalidIsolation(s.to_string())),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = KafkaClientError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

string_conversions!(AuthType, Acks, Compression, StartOffset, IsolationLevel);

/// TLS client settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Use TLS for broker connections
    pub enable: bool,
    /// CA bundle used to verify brokers
    pub ca_file: Option<String>,
    /// Client certificate for mutual TLS
    pub cert_file: Option<String>,
    /// Client private key for mutual TLS
    pub key_file: Option<String>,
    /// Password of the client private key
    pub key_password: CredentialConfig,
    /// Skip broker certificate verification
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    fn apply(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(ca) = &self.ca_file {
            config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &self.cert_file {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &self.key_file {
            config.set("ssl.key.location", key);
        }
        if !self.key_password.is_empty() {
            let password = self.key_password.fetch()?;
            config.set("ssl.key.password", password.as_str());
        }
        if self.insecure_skip_verify {
            config
                .set("enable.ssl.certificate.verification", "false")
                .set("ssl.endpoint.identification.algorithm", "none");
        }
        Ok(())
    }
}

/// Settings shared by producers, consumers and admin clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub client_id: String,
    pub auth_type: AuthType,
    pub username: String,
    /// SASL password source
    #[serde(flatten)]
    pub credential: CredentialConfig,
    pub tls: Option<TlsConfig>,
    pub aws_region: String,
    /// Falls back to `AWS_ACCESS_KEY_ID` when empty
    pub aws_access_key: String,
    /// Falls back to `AWS_SECRET_ACCESS_KEY` when empty
    pub aws_secret: CredentialConfig,
    /// Session token of temporary credentials; falls back to `AWS_SESSION_TOKEN`
    pub aws_session_token: CredentialConfig,
    pub oauth_token_url: String,
    pub oauth_client_id: String,
    pub oauth_scope: String,
    pub oauth_secret: CredentialConfig,
    #[serde(rename = "dial_timeout_ms", with = "duration_ms")]
    pub dial_timeout: Duration,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(rename = "retry_backoff_ms", with = "duration_ms")]
    pub retry_backoff: Duration,
    /// Send retries of the producer. librdkafka retries consumer and admin
    /// requests on its own schedule.
    pub max_retries: u32,
    /// Raw librdkafka properties, applied after everything else
    pub overrides: BTreeMap<String, String>,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            brokers: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            auth_type: AuthType::None,
            username: String::new(),
            credential: CredentialConfig::default(),
            tls: None,
            aws_region: String::new(),
            aws_access_key: String::new(),
            aws_secret: CredentialConfig::default(),
            aws_session_token: CredentialConfig::default(),
            oauth_token_url: String::new(),
            oauth_client_id: String::new(),
            oauth_scope: String::new(),
            oauth_secret: CredentialConfig::default(),
            dial_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            max_retries: 3,
            overrides: BTreeMap::new(),
        }
    }
}

impl BaseConfig {
    /// Config pointing at the given comma-separated broker list
    pub fn new<S: Into<String>>(brokers: S) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Trimmed, non-empty broker addresses
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(String::from)
            .collect()
    }

    /// Check the settings, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.broker_list().is_empty() {
            return Err(KafkaClientError::MissingBrokers);
        }
        match self.auth_type {
            AuthType::AwsMskIam if self.aws_region.trim().is_empty() => {
                Err(KafkaClientError::MissingAwsRegion)
            }
            AuthType::OAuth if self.oauth_token_url.trim().is_empty() => {
                Err(KafkaClientError::MissingOAuthTokenUrl)
            }
            _ => Ok(()),
        }
    }

    fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map_or(false, |tls| tls.enable)
    }

    fn security_protocol(&self) -> &'static str {
        let sasl = self.auth_type.sasl_mechanism().is_some();
        let tls = self.tls_enabled() || self.auth_type == AuthType::AwsMskIam;
        match (sasl, tls) {
            (false, false) => "plaintext",
            (false, true) => "ssl",
            (true, false) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        }
    }

    /// Connection, security and authentication properties.
    ///
    /// Secrets are fetched here, once; the fetched buffers are wiped when this
    /// returns.
    pub fn client_config(&self) -> Result<ClientConfig> {
        self.validate()?;

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.broker_list().join(","))
            .set("client.id", &self.client_id)
            .set("socket.connection.setup.timeout.ms", millis(self.dial_timeout))
            .set("socket.timeout.ms", millis(self.request_timeout))
            .set("retry.backoff.ms", millis(self.retry_backoff))
            .set("security.protocol", self.security_protocol());

        if let Some(mechanism) = self.auth_type.sasl_mechanism() {
            config.set("sasl.mechanism", mechanism);
        }

        match self.auth_type {
            AuthType::Plain | AuthType::Scram256 | AuthType::Scram512 => {
                let password = self.credential.fetch()?;
                config
                    .set("sasl.username", &self.username)
                    .set("sasl.password", password.as_str());
            }
            AuthType::OAuth => {
                let secret = self.oauth_secret.fetch()?;
                config
                    .set("sasl.oauthbearer.method", "oidc")
                    .set("sasl.oauthbearer.token.endpoint.url", &self.oauth_token_url)
                    .set("sasl.oauthbearer.client.id", &self.oauth_client_id)
                    .set("sasl.oauthbearer.client.secret", secret.as_str());
                if !self.oauth_scope.is_empty() {
                    config.set("sasl.oauthbearer.scope", &self.oauth_scope);
                }
            }
            // Tokens for IAM are signed on demand by the client context.
            AuthType::AwsMskIam | AuthType::None => {}
        }

        if let Some(tls) = self.tls.as_ref().filter(|tls| tls.enable) {
            tls.apply(&mut config)?;
        }

        Ok(config)
    }

    fn apply_overrides(&self, config: &mut ClientConfig) {
        for (key, value) in &self.overrides {
            config.set(key, value);
        }
    }
}

/// Producer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    /// Topic used for records that do not name one
    pub default_topic: String,
    /// Enables transactions when set
    pub transactional_id: Option<String>,
    pub acks: Acks,
    pub compression: Compression,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    /// Records the local queue holds before sends wait for room
    pub max_buffered_records: usize,
    #[serde(rename = "linger_ms", with = "duration_ms")]
    pub linger: Duration,
    pub idempotent: bool,
    /// Upper bound on the time a record may wait for delivery
    #[serde(rename = "delivery_timeout_ms", with = "duration_ms")]
    pub delivery_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            default_topic: String::new(),
            transactional_id: None,
            acks: Acks::Leader,
            compression: Compression::None,
            batch_max_records: 10_000,
            batch_max_bytes: 1024 * 1024, // 1MB
            max_buffered_records: 100_000,
            linger: Duration::ZERO,
            idempotent: false,
            delivery_timeout: Duration::from_secs(120),
        }
    }
}

impl ProducerConfig {
    pub fn new<S: Into<String>>(brokers: S) -> Self {
        Self {
            base: BaseConfig::new(brokers),
            ..Default::default()
        }
    }

    /// Load from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from `<PREFIX>_*` environment variables, `__` separating nested keys
    pub fn from_env(prefix: &str) -> Result<Self> {
        load_env(prefix)
    }

    /// The transactional id, if transactions are enabled
    pub fn transactional_id(&self) -> Option<&str> {
        self.transactional_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        self.base.validate()
    }

    /// Full librdkafka property set for a producer
    pub fn client_config(&self) -> Result<ClientConfig> {
        self.validate()?;
        let mut config = self.base.client_config()?;

        config
            .set("compression.type", self.compression.as_str())
            .set("batch.num.messages", self.batch_max_records.max(1).to_string())
            .set("batch.size", self.batch_max_bytes.max(1).to_string())
            .set("queue.buffering.max.messages", self.max_buffered_records.max(1).to_string())
            .set("linger.ms", millis(self.linger))
            .set("message.timeout.ms", millis(self.delivery_timeout))
            .set("request.timeout.ms", millis(self.base.request_timeout))
            .set("retries", self.base.max_retries.to_string());

        let transactional = self.transactional_id();
        if self.idempotent || transactional.is_some() {
            config
                .set("enable.idempotence", "true")
                .set("acks", Acks::All.property())
                .set("max.in.flight.requests.per.connection", "1");
        } else {
            config
                .set("enable.idempotence", "false")
                .set("acks", self.acks.property());
        }

        if let Some(id) = transactional {
            config
                .set("transactional.id", id)
                .set("transaction.timeout.ms", millis(self.delivery_timeout));
        }

        self.base.apply_overrides(&mut config);
        Ok(config)
    }
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    pub topics: Vec<String>,
    /// Consumer group; empty means direct partition assignment
    pub group: String,
    pub start_offset: StartOffset,
    pub isolation_level: IsolationLevel,
    #[serde(rename = "session_timeout_ms", with = "duration_ms")]
    pub session_timeout: Duration,
    #[serde(rename = "rebalance_timeout_ms", with = "duration_ms")]
    pub rebalance_timeout: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    pub auto_commit: bool,
    #[serde(rename = "auto_commit_interval_ms", with = "duration_ms")]
    pub auto_commit_interval: Duration,
    pub fetch_min_bytes: u32,
    pub fetch_max_bytes: u32,
    #[serde(rename = "fetch_max_wait_ms", with = "duration_ms")]
    pub fetch_max_wait: Duration,
    /// Most records returned by one poll
    pub max_poll_records: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            topics: Vec::new(),
            group: String::new(),
            start_offset: StartOffset::Latest,
            isolation_level: IsolationLevel::ReadCommitted,
            session_timeout: Duration::from_secs(45),
            rebalance_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(3),
            auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            fetch_min_bytes: 1,
            fetch_max_bytes: 50 * 1024 * 1024, // 50MB
            fetch_max_wait: Duration::from_secs(5),
            max_poll_records: 500,
        }
    }
}

impl ConsumerConfig {
    pub fn new<S: Into<String>>(brokers: S) -> Self {
        Self {
            base: BaseConfig::new(brokers),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from `<PREFIX>_*` environment variables; `<PREFIX>_TOPICS` is a
    /// comma-separated list
    pub fn from_env(prefix: &str) -> Result<Self> {
        load_env(prefix)
    }

    /// The consumer group, if group consumption is enabled
    pub fn group_id(&self) -> Option<&str> {
        let group = self.group.trim();
        (!group.is_empty()).then_some(group)
    }

    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.topics.is_empty() || self.topics.iter().any(|topic| topic.trim().is_empty()) {
            return Err(KafkaClientError::MissingTopic);
        }
        Ok(())
    }

    /// Full librdkafka property set for a consumer
    pub fn client_config(&self) -> Result<ClientConfig> {
        self.validate()?;
        let mut config = self.base.client_config()?;

        config
            .set("auto.offset.reset", self.start_offset.as_str())
            .set("isolation.level", self.isolation_level.property())
            .set("fetch.min.bytes", self.fetch_min_bytes.max(1).to_string())
            .set("fetch.max.bytes", self.fetch_max_bytes.max(1).to_string())
            .set("fetch.wait.max.ms", millis(self.fetch_max_wait))
            .set("enable.partition.eof", "false");

        match self.group_id() {
            Some(group) => {
                config
                    .set("group.id", group)
                    .set("session.timeout.ms", millis(self.session_timeout))
                    .set("heartbeat.interval.ms", millis(self.heartbeat_interval))
                    .set("max.poll.interval.ms", millis(self.rebalance_timeout))
                    .set("enable.auto.commit", self.auto_commit.to_string())
                    .set("auto.commit.interval.ms", millis(self.auto_commit_interval));
            }
            None => {
                config.set("enable.auto.commit", "false");
            }
        }

        self.base.apply_overrides(&mut config);
        Ok(config)
    }
}

/// Admin client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
}

impl AdminConfig {
    pub fn new<S: Into<String>>(brokers: S) -> Self {
        Self {
            base: BaseConfig::new(brokers),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_env(prefix: &str) -> Result<Self> {
        load_env(prefix)
    }

    pub fn validate(&self) -> Result<()> {
        self.base.validate()
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = self.base.client_config()?;
        config.set("request.timeout.ms", millis(self.base.request_timeout));
        self.base.apply_overrides(&mut config);
        Ok(config)
    }
}

fn load_env<T: serde::de::DeserializeOwned>(prefix: &str) -> Result<T> {
    let settings = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("topics"),
        )
        .build()
        .map_err(|e| KafkaClientError::config(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| KafkaClientError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_brokers() {
        let config = BaseConfig::default();
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingBrokers)));

        let config = BaseConfig::new(" , ");
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingBrokers)));
    }

    #[test]
    fn test_invalid_auth_type() {
        let err = "invalid".parse::<AuthType>().unwrap_err();
        assert!(matches!(err, KafkaClientError::InvalidAuthType(_)));

        let err = serde_json::from_str::<BaseConfig>(r#"{"brokers":"b:9092","auth_type":"invalid"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("invalid authentication type"));
    }

    #[test]
    fn test_auth_requirements() {
        let mut config = BaseConfig::new("b:9092");
        config.auth_type = AuthType::AwsMskIam;
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingAwsRegion)));
        config.aws_region = "eu-west-1".into();
        assert!(config.validate().is_ok());

        config.auth_type = AuthType::OAuth;
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingOAuthTokenUrl)));
        config.oauth_token_url = "https://idp.example.com/token".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_brokers_checked_before_auth() {
        let mut config = BaseConfig::default();
        config.auth_type = AuthType::OAuth;
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingBrokers)));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("".parse::<AuthType>().unwrap(), AuthType::None);
        assert_eq!("scram256".parse::<AuthType>().unwrap(), AuthType::Scram256);
        assert_eq!("scram-512".parse::<AuthType>().unwrap(), AuthType::Scram512);
        assert_eq!("".parse::<Acks>().unwrap(), Acks::Leader);
        assert!(matches!("most".parse::<Acks>(), Err(KafkaClientError::InvalidAcks(_))));
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert!(matches!(
            "brotli".parse::<Compression>(),
            Err(KafkaClientError::InvalidCompression(_))
        ));
        assert_eq!("start".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert!(matches!("middle".parse::<StartOffset>(), Err(KafkaClientError::InvalidOffset(_))));
        assert_eq!(
            "uncommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert!(matches!(
            "dirty".parse::<IsolationLevel>(),
            Err(KafkaClientError::InvalidIsolation(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let producer = ProducerConfig::default();
        assert_eq!(producer.acks, Acks::Leader);
        assert_eq!(producer.batch_max_records, 10_000);
        assert_eq!(producer.batch_max_bytes, 1_048_576);
        assert_eq!(producer.base.max_retries, 3);
        assert_eq!(producer.base.retry_backoff, Duration::from_millis(100));

        let consumer = ConsumerConfig::default();
        assert_eq!(consumer.start_offset, StartOffset::Latest);
        assert_eq!(consumer.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(consumer.session_timeout, Duration::from_secs(45));
        assert_eq!(consumer.fetch_max_bytes, 52_428_800);
        assert!(consumer.auto_commit);
    }

    #[test]
    fn test_consumer_requires_topics() {
        let mut config = ConsumerConfig::new("b:9092");
        assert!(matches!(config.validate(), Err(KafkaClientError::MissingTopic)));
        config.topics = vec!["orders".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_durations_in_millis() {
        let json = r#"{
            "brokers": "b1:9092,b2:9092",
            "default_topic": "events",
            "acks": "all",
            "compression": "lz4",
            "linger_ms": 25,
            "password": "secret"
        }"#;
        let config = ProducerConfig::from_json(json).unwrap();
        assert_eq!(config.base.broker_list(), vec!["b1:9092", "b2:9092"]);
        assert_eq!(config.acks, Acks::All);
        assert_eq!(config.compression, Compression::Lz4);
        assert_eq!(config.linger, Duration::from_millis(25));
        assert_eq!(config.base.credential.password, "secret");

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["linger_ms"], 25);
        assert_eq!(value["acks"], "all");
    }

    #[test]
    fn test_producer_properties() {
        let mut config = ProducerConfig::new("b1:9092, b2:9092");
        config.acks = Acks::None;
        config.compression = Compression::Snappy;
        config.linger = Duration::from_millis(5);

        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(properties.get("acks"), Some("0"));
        assert_eq!(properties.get("compression.type"), Some("snappy"));
        assert_eq!(properties.get("linger.ms"), Some("5"));
        assert_eq!(properties.get("enable.idempotence"), Some("false"));
        assert_eq!(properties.get("security.protocol"), Some("plaintext"));
    }

    #[test]
    fn test_queue_bound_independent_of_batch_size() {
        let mut config = ProducerConfig::new("b:9092");
        config.batch_max_records = 16;

        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("batch.num.messages"), Some("16"));
        assert_eq!(properties.get("queue.buffering.max.messages"), Some("100000"));

        config.max_buffered_records = 500;
        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("queue.buffering.max.messages"), Some("500"));
    }

    #[test]
    fn test_max_retries_only_reaches_producer() {
        let mut producer = ProducerConfig::new("b:9092");
        producer.base.max_retries = 7;
        assert_eq!(producer.client_config().unwrap().get("retries"), Some("7"));

        let mut consumer = ConsumerConfig::new("b:9092");
        consumer.topics = vec!["t".into()];
        consumer.base.max_retries = 7;
        assert_eq!(consumer.client_config().unwrap().get("retries"), None);
    }

    #[test]
    fn test_idempotent_forces_acks_all() {
        let mut config = ProducerConfig::new("b:9092");
        config.acks = Acks::Leader;
        config.transactional_id = Some("tx1".into());

        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("acks"), Some("all"));
        assert_eq!(properties.get("enable.idempotence"), Some("true"));
        assert_eq!(properties.get("transactional.id"), Some("tx1"));
        assert_eq!(properties.get("max.in.flight.requests.per.connection"), Some("1"));
    }

    #[test]
    fn test_sasl_properties() {
        let mut config = AdminConfig::new("b:9092");
        config.base.auth_type = AuthType::Scram512;
        config.base.username = "svc".into();
        config.base.credential = CredentialConfig::literal("pw");
        config.base.tls = Some(TlsConfig {
            enable: true,
            ca_file: Some("/etc/ssl/ca.pem".into()),
            insecure_skip_verify: true,
            ..Default::default()
        });

        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(properties.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(properties.get("sasl.username"), Some("svc"));
        assert_eq!(properties.get("sasl.password"), Some("pw"));
        assert_eq!(properties.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
        assert_eq!(properties.get("enable.ssl.certificate.verification"), Some("false"));
    }

    #[test]
    fn test_consumer_properties() {
        let mut config = ConsumerConfig::new("b:9092");
        config.topics = vec!["t".into()];
        config.group = "g".into();
        config.start_offset = StartOffset::Earliest;
        config.overrides.insert("fetch.wait.max.ms".into(), "100".into());

        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("group.id"), Some("g"));
        assert_eq!(properties.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(properties.get("isolation.level"), Some("read_committed"));
        assert_eq!(properties.get("max.poll.interval.ms"), Some("60000"));
        assert_eq!(properties.get("fetch.wait.max.ms"), Some("100"));

        config.group.clear();
        let properties = config.client_config().unwrap();
        assert_eq!(properties.get("group.id"), None);
        assert_eq!(properties.get("enable.auto.commit"), Some("false"));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("BPKTEST_BROKERS", "env-broker:9092");
        std::env::set_var("BPKTEST_TOPICS", "a,b");
        std::env::set_var("BPKTEST_GROUP", "env-group");
        std::env::set_var("BPKTEST_START_OFFSET", "earliest");
        std::env::set_var("BPKTEST_SESSION_TIMEOUT_MS", "10000");

        let config = ConsumerConfig::from_env("BPKTEST").unwrap();
        assert_eq!(config.base.brokers, "env-broker:9092");
        assert_eq!(config.topics, vec!["a", "b"]);
        assert_eq!(config.group_id(), Some("env-group"));
        assert_eq!(config.start_offset, StartOffset::Earliest);
        assert_eq!(config.session_timeout, Duration::from_secs(10));
    }
}
