use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::debug;

use crate::producer::{ProducerRecord, PublishAck, Publisher};
use crate::protocol::DltHeaders;
use crate::{ConfigError, ListenerConfig, PublishError, Record, RecoveryError};

/// Called by a partition lane once the retry policy gave up on a record.
///
/// Returning `Ok` means the record is durably placed elsewhere and its offset may be committed.
#[async_trait]
pub trait Recoverer: Send + Sync {
    async fn recover(
        &self,
        record: &Record,
        error: &anyhow::Error,
        attempts_made: u32,
    ) -> Result<PublishAck, RecoveryError>;
}

// 원본 토픽 이름에서 DLT 이름을 만든다. 예: "{topic}-dlt"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DltNaming {
    template: String,
}

impl DltNaming {
    pub const PLACEHOLDER: &'static str = "{topic}";
    pub const DEFAULT_TEMPLATE: &'static str = "{topic}-dlt";

    pub fn new(template: impl Into<String>) -> Result<Self, ConfigError> {
        let template = template.into();
        // 원본 토픽으로 되돌아가는 템플릿은 무한 루프가 된다
        if !template.contains(Self::PLACEHOLDER) || template == Self::PLACEHOLDER {
            return Err(ConfigError::InvalidTemplate(template));
        }
        Ok(Self { template })
    }

    pub fn target_topic(&self, source_topic: &str) -> String {
        self.template.replace(Self::PLACEHOLDER, source_topic)
    }
}

impl Default for DltNaming {
    fn default() -> Self {
        Self {
            template: Self::DEFAULT_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    pub original_record: Record,
    pub failure_reason: String,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub attempts_made: u32,
    pub recovered_at: DateTime<Utc>,
    pub consumer_group: Option<String>,
}

impl DeadLetterEnvelope {
    pub fn new(record: &Record, error: &anyhow::Error, attempts_made: u32) -> Self {
        Self {
            original_record: record.clone(),
            failure_reason: format!("{:#}", error),
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            attempts_made,
            recovered_at: Utc::now(),
            consumer_group: None,
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn metadata(&self) -> DltHeaders {
        DltHeaders {
            original_topic: self.original_topic.clone(),
            original_partition: self.original_partition,
            original_offset: self.original_offset,
            original_timestamp: self.original_record.timestamp,
            consumer_group: self.consumer_group.clone(),
            failure_reason: self.failure_reason.clone(),
            attempts_made: self.attempts_made,
            recovered_at: self.recovered_at,
        }
    }

    // 값은 원본 바이트 그대로, 원본 헤더 뒤에 DLT 헤더를 붙인다
    pub fn into_producer_record(self, target_topic: impl Into<String>, partition: Option<i32>) -> ProducerRecord {
        let mut headers = self.original_record.headers.clone();
        self.metadata().write_to(&mut headers);

        let mut record = ProducerRecord::new(target_topic, self.original_record.value.clone())
            .with_headers(headers);
        if let Some(key) = self.original_record.key.clone() {
            record = record.with_key(key);
        }
        if let Some(partition) = partition {
            record = record.with_partition(partition);
        }
        record
    }
}

pub struct DeadLetterRecoverer<P: Publisher> {
    publisher: Arc<P>,
    naming: DltNaming,
    consumer_group: Option<String>,
    same_partition: bool,
    publish_timeout: Option<Duration>,
}

impl<P: Publisher> DeadLetterRecoverer<P> {
    pub fn new(publisher: Arc<P>) -> Self {
        Self {
            publisher,
            naming: DltNaming::default(),
            consumer_group: None,
            same_partition: true,
            publish_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn for_listener(publisher: Arc<P>, config: &ListenerConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(publisher)
            .with_naming(config.dlt_naming()?)
            .with_consumer_group(config.group_id.clone()))
    }

    pub fn with_naming(mut self, naming: DltNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// When disabled the publisher picks the dead-letter partition.
    pub fn with_same_partition(mut self, same_partition: bool) -> Self {
        self.same_partition = same_partition;
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Option<Duration>) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn target_topic(&self, record: &Record) -> String {
        self.naming.target_topic(&record.topic)
    }

    fn envelope(&self, record: &Record, error: &anyhow::Error, attempts_made: u32) -> DeadLetterEnvelope {
        let envelope = DeadLetterEnvelope::new(record, error, attempts_made);
        match &self.consumer_group {
            Some(group) => envelope.with_consumer_group(group.clone()),
            None => envelope,
        }
    }

    async fn publish(&self, record: ProducerRecord) -> Result<PublishAck, PublishError> {
        match self.publish_timeout {
            Some(limit) => timeout(limit, self.publisher.publish(record))
                .await
                .map_err(|_| {
                    PublishError::TimeoutError(format!("No acknowledgment within {:?}", limit))
                })?,
            None => self.publisher.publish(record).await,
        }
    }
}

#[async_trait]
impl<P: Publisher> Recoverer for DeadLetterRecoverer<P> {
    async fn recover(
        &self,
        record: &Record,
        error: &anyhow::Error,
        attempts_made: u32,
    ) -> Result<PublishAck, RecoveryError> {
        let target = self.target_topic(record);
        let partition = self.same_partition.then_some(record.partition);
        let dlt_record = self
            .envelope(record, error, attempts_made)
            .into_producer_record(target.clone(), partition);

        debug!(
            "Publishing {}-{}@{} to dead-letter topic {}",
            record.topic, record.partition, record.offset, target
        );

        self.publish(dlt_record)
            .await
            .map_err(|source| RecoveryError::PublishFailed {
                origin: record.topic_partition(),
                offset: record.offset,
                target,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use crate::{InMemoryBroker, TopicPartition};
    use bytes::Bytes;

    #[test]
    fn naming_is_deterministic_and_rejects_identity_templates() {
        let naming = DltNaming::default();
        assert_eq!(naming.target_topic("topic1"), "topic1-dlt");
        assert_eq!(naming.target_topic("topic1"), naming.target_topic("topic1"));

        let custom = DltNaming::new("dlq.{topic}").unwrap();
        assert_eq!(custom.target_topic("orders"), "dlq.orders");

        assert!(DltNaming::new("{topic}").is_err());
        assert!(DltNaming::new("static-dlt").is_err());
    }

    #[test]
    fn envelope_record_keeps_payload_key_and_original_headers() {
        let record = Record::new("topic1", 2, 17, Bytes::from_static(b"\x00fail-x\xff"))
            .with_key("k")
            .with_header("trace-id", "abc");
        let envelope = DeadLetterEnvelope::new(&record, &anyhow::anyhow!("boom"), 3)
            .with_consumer_group("fooGroup");

        let out = envelope.into_producer_record("topic1-dlt", Some(2));

        assert_eq!(out.topic, "topic1-dlt");
        assert_eq!(out.partition, Some(2));
        assert_eq!(out.value, record.value);
        assert_eq!(out.key, record.key);
        assert_eq!(out.headers.iter().next().map(|(k, _)| k), Some("trace-id"));

        let meta = DltHeaders::from_headers(&out.headers).unwrap();
        assert_eq!(meta.original_topic, "topic1");
        assert_eq!(meta.original_partition, 2);
        assert_eq!(meta.original_offset, 17);
        assert_eq!(meta.failure_reason, "boom");
        assert_eq!(meta.attempts_made, 3);
        assert_eq!(meta.consumer_group.as_deref(), Some("fooGroup"));
    }

    #[test]
    fn failure_reason_includes_error_chain() {
        let error = anyhow::anyhow!("connection refused").context("downstream unavailable");
        let record = Record::new("topic1", 0, 0, "x");
        let envelope = DeadLetterEnvelope::new(&record, &error, 1);
        assert_eq!(
            envelope.failure_reason,
            "downstream unavailable: connection refused"
        );
    }

    #[tokio::test]
    async fn recover_publishes_to_same_partition_of_derived_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("topic1-dlt", 2);
        let recoverer = DeadLetterRecoverer::new(broker.clone()).with_consumer_group("fooGroup");

        let record = Record::new("topic1", 1, 5, "fail-x");
        let ack = recoverer
            .recover(&record, &anyhow::anyhow!("failed"), 3)
            .await
            .unwrap();

        assert_eq!(ack.topic_partition(), TopicPartition::new("topic1-dlt", 1));
        let placed = broker.records(&ack.topic_partition()).await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].value, Bytes::from_static(b"fail-x"));
        assert_eq!(placed[0].headers.get_str(protocol::ORIGINAL_OFFSET), Some("5"));
        assert_eq!(placed[0].headers.get_str(protocol::ATTEMPTS_MADE), Some("3"));
    }

    #[tokio::test]
    async fn recover_reports_missing_dead_letter_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let recoverer = DeadLetterRecoverer::new(broker);

        let record = Record::new("topic1", 0, 9, "fail-x");
        let err = recoverer
            .recover(&record, &anyhow::anyhow!("failed"), 1)
            .await
            .unwrap_err();

        assert_eq!(
            err.publish_error(),
            &PublishError::UnknownTopic("topic1-dlt".to_string())
        );
    }

    struct Stalled;

    #[async_trait]
    impl Publisher for Stalled {
        async fn publish(&self, _record: ProducerRecord) -> Result<PublishAck, PublishError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recover_times_out_without_acknowledgment() {
        let recoverer = DeadLetterRecoverer::new(Arc::new(Stalled))
            .with_publish_timeout(Some(Duration::from_secs(5)));

        let record = Record::new("topic1", 0, 0, "fail-x");
        let err = recoverer
            .recover(&record, &anyhow::anyhow!("failed"), 1)
            .await
            .unwrap_err();

        assert!(matches!(err.publish_error(), PublishError::TimeoutError(_)));
    }
}
