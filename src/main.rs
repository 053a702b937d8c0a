use std::sync::Arc;

use bytes::Bytes;
use kafka_dlt_pipeline::{
    DeadLetterRecoverer, InMemoryBroker, JsonRecordHandler, ListenerContainer, Producer,
};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

mod listeners;
mod model;

use listeners::{DltListener, Foo2, FooListener};
use model::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(std::env::args().nth(1).as_deref())?;

    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level()?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting dead-letter sample consumer");

    // 토픽 생성
    let listener_config = config.listener_config();
    let dlt_topic = listener_config.dlt_topic()?;
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic(&config.topic, config.partitions);
    broker.create_topic(&dlt_topic, config.partitions);

    // 메인 리스너: 재시도 후 DLT로 보낸다
    let recoverer = DeadLetterRecoverer::for_listener(broker.clone(), &listener_config)?;
    let listener = ListenerContainer::new(
        listener_config,
        Arc::new(broker.consumer(config.group_id.clone())),
        Arc::new(JsonRecordHandler::<Foo2, _>::new(FooListener)),
        Arc::new(recoverer),
    )?;

    // DLT 리스너
    let dlt_config = config.dlt_listener_config(&dlt_topic);
    let dlt_recoverer = DeadLetterRecoverer::for_listener(broker.clone(), &dlt_config)?;
    let dlt_listener = ListenerContainer::new(
        dlt_config,
        Arc::new(broker.consumer(config.dlt_group_id.clone())),
        Arc::new(DltListener),
        Arc::new(dlt_recoverer),
    )?;

    let partitions: Vec<i32> = (0..config.partitions.max(1)).collect();
    listener.on_partitions_assigned(&partitions).await;
    dlt_listener.on_partitions_assigned(&partitions).await;

    // 샘플 메시지 발행
    let producer = Producer::new(broker.clone()).with_default_topic(config.topic.clone());
    for payload in &config.sample_payloads {
        let ack = producer
            .send_raw(None::<Bytes>, payload.clone(), None)
            .await?;
        info!("Sent {} to {}-{}@{}", payload, ack.topic, ack.partition, ack.offset);
    }

    println!("Hit Ctrl+C to terminate...");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let mut exits = listener.shutdown().await;
    exits.extend(dlt_listener.shutdown().await);
    for (partition, exit) in exits {
        if let Err(e) = exit {
            error!("Partition {} stopped with error: {}", partition, e);
        }
    }

    info!("Shutting down");
    Ok(())
}
