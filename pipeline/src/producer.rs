use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::{Headers, PublishError, TopicPartition};

// 발행할 레코드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            headers: Headers::default(),
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.append(key, value);
        self
    }
}

// 브로커가 돌려준 발행 확인
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PublishAck {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// Publishes one record and resolves once the broker acknowledged it.
///
/// Implementations may be shared between partition lanes; every call is acknowledged on its own.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, record: ProducerRecord) -> Result<PublishAck, PublishError>;
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, record: ProducerRecord) -> Result<PublishAck, PublishError> {
        (**self).publish(record).await
    }
}

pub struct Producer<P: Publisher> {
    publisher: Arc<P>,
    default_topic: Option<String>,
}

impl<P: Publisher> Producer<P> {
    pub fn new(publisher: Arc<P>) -> Self {
        Self {
            publisher,
            default_topic: None,
        }
    }

    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    fn resolve_topic(&self, topic: Option<&str>) -> Result<String> {
        topic
            .map(|t| t.to_string())
            .or_else(|| self.default_topic.clone())
            .ok_or_else(|| anyhow::anyhow!("No topic specified and no default topic set"))
    }

    pub async fn send<K, V>(&self, key: Option<K>, value: V, topic: Option<&str>) -> Result<PublishAck>
    where
        K: Into<Bytes>,
        V: Serialize,
    {
        let serialized = serde_json::to_vec(&value)?;
        self.send_raw(key, serialized, topic).await
    }

    pub async fn send_raw<K, V>(&self, key: Option<K>, value: V, topic: Option<&str>) -> Result<PublishAck>
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let topic = self.resolve_topic(topic)?;

        let mut record = ProducerRecord::new(topic, value);
        if let Some(key) = key {
            record = record.with_key(key);
        }

        Ok(self.publisher.publish(record).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    #[tokio::test]
    async fn send_serializes_json_to_default_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("topic1", 1);

        let producer = Producer::new(broker.clone()).with_default_topic("topic1");
        let ack = producer
            .send(Some("k1"), serde_json::json!({ "foo": "bar" }), None)
            .await
            .unwrap();

        assert_eq!(ack.topic, "topic1");
        assert_eq!(ack.offset, 0);

        let records = broker.records(&TopicPartition::new("topic1", 0)).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, Bytes::from_static(br#"{"foo":"bar"}"#));
        assert_eq!(records[0].key, Some(Bytes::from_static(b"k1")));
    }

    #[tokio::test]
    async fn send_without_topic_fails() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = Producer::new(broker);

        let result = producer.send_raw(None::<Bytes>, "payload", None).await;
        assert!(result.is_err());
    }
}
