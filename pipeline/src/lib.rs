use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod consumer;
pub mod handler;
pub mod memory;
pub mod producer;
pub mod protocol;
pub mod recoverer;
pub mod retry;
pub mod source;

pub use consumer::{ListenerContainer, ListenerMetrics, MetricsSnapshot, PartitionLane};
pub use handler::{handler_fn, HandlerInvoker, JsonHandler, JsonRecordHandler, RecordHandler};
pub use memory::{InMemoryBroker, InMemoryConsumer};
pub use producer::{Producer, ProducerRecord, PublishAck, Publisher};
pub use protocol::DltHeaders;
pub use recoverer::{DeadLetterEnvelope, DeadLetterRecoverer, DltNaming, Recoverer};
pub use retry::{FixedBackOff, RetryDecision, RetryPolicy, RetryState};
pub use source::MessageSource;

// 메시지 소스(poll/commit) 에러
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Poll error on {0}: {1}")]
    PollError(TopicPartition, String),

    #[error("Commit error on {0}: {1}")]
    CommitError(TopicPartition, String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(TopicPartition),

    #[error("Source closed")]
    Closed,
}

// 발행(publish) 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(TopicPartition),
}

// DLT 발행 실패. 비즈니스 실패가 아니라 인프라 실패다.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Dead-letter publish of {origin}@{offset} to {target} failed: {source}")]
    PublishFailed {
        origin: TopicPartition,
        offset: i64,
        target: String,
        #[source]
        source: PublishError,
    },
}

impl RecoveryError {
    pub fn publish_error(&self) -> &PublishError {
        match self {
            RecoveryError::PublishFailed { source, .. } => source,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    MissingValue(&'static str),

    #[error("Invalid dead-letter topic template: {0}")]
    InvalidTemplate(String),
}

// 파티션 레인을 멈추게 하는 에러들. 처리(processing) 실패는 여기에 포함되지 않는다.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lane aborted: {0}")]
    LaneAborted(String),
}

impl ListenerError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ListenerError::Recovery(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Ordered record headers. Duplicate keys are allowed; lookups return the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Bytes>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// 소스에서 읽은 레코드. 읽은 뒤에는 변경하지 않는다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            headers: Headers::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

// DLT 발행 자체가 실패했을 때의 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryFailureMode {
    #[default]
    /// Stop the partition lane without committing; an operator has to step in.
    Halt,
    /// Keep republishing with exponential backoff until it succeeds or shutdown is requested.
    RetryForever { initial: Duration, max: Duration },
}

// 리스너 설정
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub container_id: String,
    pub topic: String,
    pub group_id: String,
    pub retry_delay: Duration,
    pub max_attempts: u32,
    pub dlt_template: String,
    pub recovery_failure_mode: RecoveryFailureMode,
    pub worker_pool_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            container_id: format!("kafka-dlt-listener-{}", Uuid::new_v4()),
            topic: "topic1".to_string(),
            group_id: "fooGroup".to_string(),
            retry_delay: Duration::from_secs(1),
            max_attempts: 2,
            dlt_template: DltNaming::DEFAULT_TEMPLATE.to_string(),
            recovery_failure_mode: RecoveryFailureMode::Halt,
            worker_pool_size: 0,
        }
    }
}

impl ListenerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }

    pub fn with_retry(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.retry_delay = delay;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_dlt_template(mut self, template: impl Into<String>) -> Self {
        self.dlt_template = template.into();
        self
    }

    pub fn with_recovery_failure_mode(mut self, mode: RecoveryFailureMode) -> Self {
        self.recovery_failure_mode = mode;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::MissingValue("topic"));
        }
        if self.group_id.is_empty() {
            return Err(ConfigError::MissingValue("group_id"));
        }
        self.dlt_naming()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> FixedBackOff {
        FixedBackOff::new(self.retry_delay, self.max_attempts)
    }

    pub fn dlt_naming(&self) -> Result<DltNaming, ConfigError> {
        DltNaming::new(self.dlt_template.clone())
    }

    pub fn dlt_topic(&self) -> Result<String, ConfigError> {
        Ok(self.dlt_naming()?.target_topic(&self.topic))
    }
}
