//! Error types for the Kafka client facade

use std::error::Error as StdError;
use std::io;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Message fragments that mark an error as a terminated connection even when
/// the library did not return a typed error.
const CLOSED_PATTERNS: &[&str] = &[
    "use of closed network connection",
    "broken pipe",
    "connection reset by peer",
    "client closed",
];

/// Main error type for Kafka client operations
#[derive(Debug, thiserror::Error)]
pub enum KafkaClientError {
    /// No broker address was configured
    #[error("brokers address is required")]
    MissingBrokers,

    /// No topic was configured or resolvable for a record
    #[error("topic is required")]
    MissingTopic,

    /// The operation requires a consumer group
    #[error("consumer group is required")]
    MissingGroup,

    /// The facade was closed
    #[error("client is closed")]
    ClientClosed,

    #[error("invalid authentication type: {0:?}")]
    InvalidAuthType(String),

    #[error("invalid acks value: {0:?}")]
    InvalidAcks(String),

    #[error("invalid compression type: {0:?}")]
    InvalidCompression(String),

    #[error("invalid start offset: {0:?}")]
    InvalidOffset(String),

    #[error("invalid isolation level: {0:?}")]
    InvalidIsolation(String),

    /// The transaction was aborted or already finished
    #[error("transaction was aborted")]
    TransactionAborted,

    /// Transactions need a producer configured with a transactional id
    #[error("transactional ID is required for transactions")]
    NoTransactionalId,

    /// Another transaction is still active on this producer
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("AWS region is required for AWS MSK IAM authentication")]
    MissingAwsRegion,

    #[error("OAuth token URL is required for OAuth authentication")]
    MissingOAuthTokenUrl,

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Errors reported by librdkafka or the broker
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Loading configuration from the environment or a file failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Building SASL credentials failed
    #[error("authentication error: {0}")]
    Authentication(String),

    /// A user-supplied handler failed
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn StdError + Send + Sync>),
}

impl KafkaClientError {
    /// Wrap an application error returned from a consume handler
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Handler(error.into())
    }

    /// Create a configuration loading error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Build the error for a broker-side error code
    pub fn from_code(code: RDKafkaErrorCode) -> Self {
        Self::Kafka(KafkaError::AdminOp(code))
    }

    /// The broker error code carried by this error, if any
    pub fn code(&self) -> Option<RDKafkaErrorCode> {
        match self {
            Self::Kafka(err) => err.rdkafka_error_code(),
            _ => None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Kafka(err) => matches!(
                err.rdkafka_error_code(),
                Some(
                    RDKafkaErrorCode::BrokerTransportFailure
                        | RDKafkaErrorCode::AllBrokersDown
                        | RDKafkaErrorCode::RequestTimedOut
                        | RDKafkaErrorCode::MessageTimedOut
                        | RDKafkaErrorCode::QueueFull
                        | RDKafkaErrorCode::LeaderNotAvailable
                        | RDKafkaErrorCode::NotLeaderForPartition
                        | RDKafkaErrorCode::NotEnoughReplicas
                        | RDKafkaErrorCode::NetworkException
                        | RDKafkaErrorCode::CoordinatorNotAvailable
                        | RDKafkaErrorCode::NotCoordinator
                )
            ),
            _ => false,
        }
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::MissingBrokers
                | Self::MissingTopic
                | Self::InvalidAuthType(_)
                | Self::InvalidAcks(_)
                | Self::InvalidCompression(_)
                | Self::InvalidOffset(_)
                | Self::InvalidIsolation(_)
                | Self::MissingAwsRegion
                | Self::MissingOAuthTokenUrl
                | Self::Config(_)
        )
    }

    /// Check if this error signals a graceful connection shutdown.
    ///
    /// Consume loops treat these as a stop signal rather than a failure. Typed
    /// causes are checked along the whole source chain first, then the
    /// rendered message is matched against known fragments.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ClientClosed | Self::Cancelled => return true,
            Self::Kafka(KafkaError::Canceled) => return true,
            Self::Io(err) if is_closed_io(err) => return true,
            _ => {}
        }

        let mut source = self.source();
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if is_closed_io(io_err) {
                    return true;
                }
            }
            if let Some(client_err) = err.downcast_ref::<KafkaClientError>() {
                if client_err.is_closed() {
                    return true;
                }
            }
            source = err.source();
        }

        let message = self.to_string().to_lowercase();
        CLOSED_PATTERNS.iter().any(|pattern| message.contains(pattern))
    }
}

fn is_closed_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
