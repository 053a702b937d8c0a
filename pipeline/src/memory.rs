use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use crate::producer::{ProducerRecord, PublishAck, Publisher};
use crate::source::MessageSource;
use crate::{PublishError, Record, SourceError, TopicPartition};

// 파티션 로그. 오프셋 = 벡터 인덱스
#[derive(Default)]
struct PartitionLog {
    records: RwLock<Vec<Record>>,
    appended: Notify,
}

/// Partitioned, in-process broker used by the sample binary and the tests.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: DashMap<String, Arc<Vec<Arc<PartitionLog>>>>,
    committed: DashMap<(String, TopicPartition), i64>,
    round_robin: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // 토픽 생성. 이미 있으면 false
    pub fn create_topic(&self, name: &str, partitions: i32) -> bool {
        if self.topics.contains_key(name) {
            return false;
        }

        let logs = (0..partitions.max(1))
            .map(|_| Arc::new(PartitionLog::default()))
            .collect();
        self.topics.insert(name.to_string(), Arc::new(logs));
        info!("Created topic {} with {} partition(s)", name, partitions.max(1));
        true
    }

    pub fn partitions(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|logs| logs.len() as i32)
    }

    pub fn consumer(self: &Arc<Self>, group_id: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            group_id: group_id.into(),
            positions: DashMap::new(),
        }
    }

    pub fn committed(&self, group_id: &str, partition: &TopicPartition) -> Option<i64> {
        self.committed
            .get(&(group_id.to_string(), partition.clone()))
            .map(|offset| *offset)
    }

    pub async fn records(&self, partition: &TopicPartition) -> Vec<Record> {
        match self.log(partition) {
            Some(log) => log.records.read().await.clone(),
            None => Vec::new(),
        }
    }

    fn log(&self, partition: &TopicPartition) -> Option<Arc<PartitionLog>> {
        // DashMap 가드는 await 전에 놓는다
        let logs = self.topics.get(&partition.topic)?.clone();
        usize::try_from(partition.partition)
            .ok()
            .and_then(|index| logs.get(index).cloned())
    }

    fn pick_partition(&self, record: &ProducerRecord, count: usize) -> usize {
        match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % count,
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, record: ProducerRecord) -> Result<PublishAck, PublishError> {
        let logs = self
            .topics
            .get(&record.topic)
            .map(|logs| logs.clone())
            .ok_or_else(|| PublishError::UnknownTopic(record.topic.clone()))?;

        let partition = match record.partition {
            Some(p) => p,
            None => self.pick_partition(&record, logs.len()) as i32,
        };
        let log = usize::try_from(partition)
            .ok()
            .and_then(|index| logs.get(index).cloned())
            .ok_or_else(|| {
                PublishError::UnknownPartition(TopicPartition::new(record.topic.clone(), partition))
            })?;

        let offset = {
            let mut records = log.records.write().await;
            let offset = records.len() as i64;
            records.push(Record {
                topic: record.topic.clone(),
                partition,
                offset,
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp: Utc::now(),
            });
            offset
        };
        log.appended.notify_waiters();

        debug!("Appended {}-{}@{}", record.topic, partition, offset);

        Ok(PublishAck {
            topic: record.topic,
            partition,
            offset,
        })
    }
}

// 컨슈머 그룹 하나의 읽기 위치. 새로 만들면 마지막 커밋 다음부터 읽는다.
pub struct InMemoryConsumer {
    broker: Arc<InMemoryBroker>,
    group_id: String,
    positions: DashMap<TopicPartition, i64>,
}

impl InMemoryConsumer {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn position(&self, partition: &TopicPartition) -> i64 {
        if let Some(position) = self.positions.get(partition) {
            return *position;
        }
        self.broker
            .committed(&self.group_id, partition)
            .map(|offset| offset + 1)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageSource for InMemoryConsumer {
    async fn poll(&self, partition: &TopicPartition) -> Result<Record, SourceError> {
        let log = self
            .broker
            .log(partition)
            .ok_or_else(|| SourceError::UnknownPartition(partition.clone()))?;

        loop {
            // 확인 전에 대기자를 등록해야 알림을 놓치지 않는다
            let appended = log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let position = self.position(partition);
            let record = match usize::try_from(position) {
                Ok(index) => log.records.read().await.get(index).cloned(),
                Err(_) => None,
            };

            if let Some(record) = record {
                self.positions.insert(partition.clone(), position + 1);
                return Ok(record);
            }

            appended.await;
        }
    }

    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), SourceError> {
        if self.broker.log(partition).is_none() {
            return Err(SourceError::UnknownPartition(partition.clone()));
        }

        self.broker
            .committed
            .insert((self.group_id.clone(), partition.clone()), offset);
        debug!("Group {} committed {}@{}", self.group_id, partition, offset);
        Ok(())
    }

    async fn rewind(&self, partition: &TopicPartition) -> Result<(), SourceError> {
        if self.broker.log(partition).is_none() {
            return Err(SourceError::UnknownPartition(partition.clone()));
        }

        // 위치를 지우면 다음 poll은 마지막 커밋 다음부터 읽는다
        self.positions.remove(partition);
        debug!(
            "Group {} rewound {} to {}",
            self.group_id,
            partition,
            self.position(partition)
        );
        Ok(())
    }
}
