use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::Record;

/// Business logic for one record.
///
/// Must tolerate redelivery and must never commit offsets itself; the partition lane decides when
/// a record is done.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: Record) -> Result<()>;
}

pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, record: Record) -> Result<()> {
        (self.f)(record).await
    }
}

// 역직렬화된 값을 받는 핸들러
#[async_trait]
pub trait JsonHandler<T>: Send + Sync {
    async fn handle(&self, value: T, record: &Record) -> Result<()>;
}

// JSON 페이로드를 T로 역직렬화해서 넘기는 데코레이터.
// 역직렬화 실패도 일반 처리 실패로 취급한다.
pub struct JsonRecordHandler<T, H> {
    inner: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, H> JsonRecordHandler<T, H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> RecordHandler for JsonRecordHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: JsonHandler<T>,
{
    async fn handle(&self, record: Record) -> Result<()> {
        let value: T = serde_json::from_slice(&record.value).with_context(|| {
            format!(
                "Failed to deserialize payload of {}-{}@{}",
                record.topic, record.partition, record.offset
            )
        })?;
        self.inner.handle(value, &record).await
    }
}

// 핸들러 호출기. 워커 풀이 있으면 별도 태스크에서 실행하지만
// 레인은 항상 결과를 기다린다.
#[derive(Clone)]
pub struct HandlerInvoker {
    handler: Arc<dyn RecordHandler>,
    workers: Option<Arc<Semaphore>>,
}

impl HandlerInvoker {
    pub fn new(handler: Arc<dyn RecordHandler>) -> Self {
        Self {
            handler,
            workers: None,
        }
    }

    /// Offloads handler calls to at most `size` concurrent tasks shared by every lane.
    /// A size of zero runs the handler inline on the lane.
    pub fn with_worker_pool(mut self, size: usize) -> Self {
        self.workers = (size > 0).then(|| Arc::new(Semaphore::new(size)));
        self
    }

    pub async fn invoke(&self, record: &Record) -> Result<()> {
        let Some(workers) = &self.workers else {
            return self.handler.handle(record.clone()).await;
        };

        let permit = workers
            .clone()
            .acquire_owned()
            .await
            .context("Worker pool closed")?;
        let handler = self.handler.clone();
        let record = record.clone();

        let task = tokio::spawn(async move {
            let _permit = permit;
            handler.handle(record).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "Handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Err(anyhow::anyhow!("Handler task cancelled: {}", e)),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Deserialize)]
    struct Foo {
        foo: String,
    }

    struct FooHandler;

    #[async_trait]
    impl JsonHandler<Foo> for FooHandler {
        async fn handle(&self, value: Foo, _record: &Record) -> Result<()> {
            if value.foo.starts_with("fail") {
                anyhow::bail!("failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn json_handler_deserializes_payload() {
        let handler = JsonRecordHandler::<Foo, _>::new(FooHandler);

        assert!(handler
            .handle(Record::new("topic1", 0, 0, r#"{"foo":"bar"}"#))
            .await
            .is_ok());

        let err = handler
            .handle(Record::new("topic1", 0, 1, r#"{"foo":"fail-x"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed");
    }

    #[tokio::test]
    async fn json_handler_reports_malformed_payload_as_failure() {
        let handler = JsonRecordHandler::<Foo, _>::new(FooHandler);
        let err = handler
            .handle(Record::new("topic1", 0, 4, "not json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("topic1-0@4"));
    }

    #[tokio::test]
    async fn inline_invoker_returns_handler_result() {
        let invoker = HandlerInvoker::new(Arc::new(handler_fn(|record: Record| async move {
            if record.value.as_ref() == b"ok" {
                Ok(())
            } else {
                Err(anyhow::anyhow!("bad value"))
            }
        })));

        assert!(invoker.invoke(&Record::new("t", 0, 0, "ok")).await.is_ok());
        assert!(invoker.invoke(&Record::new("t", 0, 1, "nope")).await.is_err());
    }

    struct Panicking;

    #[async_trait]
    impl RecordHandler for Panicking {
        async fn handle(&self, _record: Record) -> Result<()> {
            panic!("handler blew up")
        }
    }

    #[tokio::test]
    async fn pooled_invoker_turns_panic_into_failure() {
        let invoker = HandlerInvoker::new(Arc::new(Panicking)).with_worker_pool(2);

        let err = invoker
            .invoke(&Record::new("t", 0, 0, "x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("handler blew up"));
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrent_handlers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler = {
            let running = running.clone();
            let peak = peak.clone();
            handler_fn(move |_record: Record| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            })
        };
        let invoker = HandlerInvoker::new(Arc::new(handler)).with_worker_pool(2);

        let calls: Vec<_> = (0..6)
            .map(|offset| {
                let invoker = invoker.clone();
                tokio::spawn(async move { invoker.invoke(&Record::new("t", 0, offset, "x")).await })
            })
            .collect();
        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().is_ok());
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
