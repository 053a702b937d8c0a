use anyhow::Result;
use async_trait::async_trait;
use kafka_dlt_pipeline::{DltHeaders, JsonHandler, Record, RecordHandler};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Foo2 {
    pub foo: String,
}

// 메인 리스너. "fail"로 시작하는 값은 강제로 실패시켜 DLT 흐름을 확인한다
pub struct FooListener;

#[async_trait]
impl JsonHandler<Foo2> for FooListener {
    async fn handle(&self, value: Foo2, record: &Record) -> Result<()> {
        info!(
            "Received: {:?} ({}-{}@{})",
            value, record.topic, record.partition, record.offset
        );

        if value.foo.starts_with("fail") {
            anyhow::bail!("failed");
        }

        Ok(())
    }
}

// DLT 리스너. 페이로드는 바이트 그대로 받는다
pub struct DltListener;

#[async_trait]
impl RecordHandler for DltListener {
    async fn handle(&self, record: Record) -> Result<()> {
        let payload = String::from_utf8_lossy(&record.value);
        match DltHeaders::from_headers(&record.headers) {
            Ok(meta) => error!(
                "Received from DLT: {} (from {}-{}@{} after {} attempts: {})",
                payload,
                meta.original_topic,
                meta.original_partition,
                meta.original_offset,
                meta.attempts_made,
                meta.failure_reason
            ),
            Err(e) => error!("Received from DLT: {} (no dead-letter metadata: {})", payload, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_dlt_pipeline::JsonRecordHandler;

    #[tokio::test]
    async fn foo_listener_fails_on_fail_prefix() {
        let handler = JsonRecordHandler::<Foo2, _>::new(FooListener);

        assert!(handler
            .handle(Record::new("topic1", 0, 0, r#"{"foo":"bar"}"#))
            .await
            .is_ok());
        assert!(handler
            .handle(Record::new("topic1", 0, 1, r#"{"foo":"fail-test"}"#))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dlt_listener_accepts_records_without_metadata() {
        assert!(DltListener
            .handle(Record::new("topic1-dlt", 0, 0, "raw"))
            .await
            .is_ok());
    }
}
