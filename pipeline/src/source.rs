use std::sync::Arc;

use async_trait::async_trait;

use crate::{Record, SourceError, TopicPartition};

// 파티션 단위로 순서가 보장된 레코드를 제공하는 소스.
// 리밸런싱, 연결 관리는 구현체(브로커 클라이언트)의 몫이다.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next record of `partition`.
    async fn poll(&self, partition: &TopicPartition) -> Result<Record, SourceError>;

    /// Acknowledges every record of `partition` up to and including `offset`.
    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), SourceError>;

    /// Moves the read position of `partition` back to the record after the last committed offset.
    /// Called whenever a lane (re)starts so uncommitted records are delivered again.
    async fn rewind(&self, partition: &TopicPartition) -> Result<(), SourceError>;
}

#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for Arc<T> {
    async fn poll(&self, partition: &TopicPartition) -> Result<Record, SourceError> {
        (**self).poll(partition).await
    }

    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), SourceError> {
        (**self).commit(partition, offset).await
    }

    async fn rewind(&self, partition: &TopicPartition) -> Result<(), SourceError> {
        (**self).rewind(partition).await
    }
}
