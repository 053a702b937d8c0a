use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::{HandlerInvoker, RecordHandler};
use crate::recoverer::Recoverer;
use crate::retry::{RetryPolicy, RetryState};
use crate::source::MessageSource;
use crate::{
    ConfigError, ListenerConfig, ListenerError, Record, RecoveryFailureMode, TopicPartition,
};

// 리스너 카운터. processing 실패와 infrastructure 실패를 따로 센다.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    processed: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    processing_failures: AtomicU64,
    infrastructure_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub processing_failures: u64,
    pub infrastructure_failures: u64,
}

impl ListenerMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
            infrastructure_failures: self.infrastructure_failures.load(Ordering::Relaxed),
        }
    }
}

// 레코드 하나의 처리 결과
enum Outcome {
    // 성공 또는 DLT 발행 완료. 오프셋 커밋 가능
    Completed,
    // 종료 요청으로 중단. 커밋하지 않는다
    Abandoned,
}

/// Sequential processing lane for one partition.
///
/// A record reaches its terminal state (committed, or dead-lettered and committed) before the
/// next record of the partition is polled.
pub struct PartitionLane {
    partition: TopicPartition,
    source: Arc<dyn MessageSource>,
    invoker: HandlerInvoker,
    policy: Arc<dyn RetryPolicy>,
    recoverer: Arc<dyn Recoverer>,
    recovery_mode: RecoveryFailureMode,
    metrics: Arc<ListenerMetrics>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl PartitionLane {
    pub fn new(
        partition: TopicPartition,
        source: Arc<dyn MessageSource>,
        invoker: HandlerInvoker,
        policy: Arc<dyn RetryPolicy>,
        recoverer: Arc<dyn Recoverer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            partition,
            source,
            invoker,
            policy,
            recoverer,
            recovery_mode: RecoveryFailureMode::Halt,
            metrics: Arc::new(ListenerMetrics::default()),
            shutdown_rx,
        }
    }

    pub fn with_recovery_failure_mode(mut self, mode: RecoveryFailureMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ListenerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs until shutdown is requested (`Ok`) or the lane can no longer make progress safely.
    pub async fn run(mut self) -> Result<(), ListenerError> {
        // 이전 레인이 남긴 미커밋 레코드부터 다시 받는다
        self.source.rewind(&self.partition).await?;
        info!("Partition lane {} started", self.partition);

        loop {
            let record = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Partition lane {} stopping", self.partition);
                    return Ok(());
                }
                polled = self.source.poll(&self.partition) => polled?,
            };

            match self.process(&record).await? {
                Outcome::Completed => {
                    self.source.commit(&self.partition, record.offset).await?;
                    debug!("Committed {}@{}", self.partition, record.offset);
                }
                Outcome::Abandoned => {
                    info!(
                        "Partition lane {} stopping, {}@{} left uncommitted",
                        self.partition, self.partition, record.offset
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn process(&mut self, record: &Record) -> Result<Outcome, ListenerError> {
        let mut state = RetryState::new();

        let last_error = loop {
            let err = match self.invoker.invoke(record).await {
                Ok(()) => {
                    if state.attempt() > 0 {
                        info!(
                            "{}-{}@{} processed after {} retries",
                            record.topic,
                            record.partition,
                            record.offset,
                            state.attempt()
                        );
                    }
                    self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                    return Ok(Outcome::Completed);
                }
                Err(err) => err,
            };

            state.record_failure(&err);
            self.metrics.processing_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                failure_kind = "processing",
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                attempt = state.attempts_made(),
                "Processing failed: {:#}",
                err
            );

            let decision = self.policy.decide(state.attempt());
            if !decision.retry {
                break err;
            }

            debug!(
                "Retrying {}-{}@{} in {:?}",
                record.topic, record.partition, record.offset, decision.delay
            );
            if !self.pause(decision.delay).await {
                return Ok(Outcome::Abandoned);
            }
            state.advance();
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
        };

        self.recover(record, &last_error, state.attempts_made()).await
    }

    async fn recover(
        &mut self,
        record: &Record,
        error: &anyhow::Error,
        attempts_made: u32,
    ) -> Result<Outcome, ListenerError> {
        let mut publish_backoff: Option<ExponentialBackoff> = None;

        loop {
            match self.recoverer.recover(record, error, attempts_made).await {
                Ok(ack) => {
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempts_made,
                        "Dead-lettered to {}-{}@{}",
                        ack.topic,
                        ack.partition,
                        ack.offset
                    );
                    return Ok(Outcome::Completed);
                }
                Err(err) => {
                    self.metrics
                        .infrastructure_failures
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        failure_kind = "infrastructure",
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Dead-letter publish failed: {}",
                        err
                    );

                    let delay = match self.recovery_mode {
                        RecoveryFailureMode::Halt => return Err(err.into()),
                        RecoveryFailureMode::RetryForever { initial, max } => publish_backoff
                            .get_or_insert_with(|| republish_backoff(initial, max))
                            .next_backoff()
                            .unwrap_or(max),
                    };

                    warn!("Republishing {}@{} in {:?}", self.partition, record.offset, delay);
                    if !self.pause(delay).await {
                        return Ok(Outcome::Abandoned);
                    }
                }
            }
        }
    }

    // 백오프 대기. 종료 요청이 오면 false
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.recv() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn republish_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: max,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

struct LaneHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<Result<(), ListenerError>>,
}

async fn join_lane(handle: LaneHandle) -> Result<(), ListenerError> {
    match handle.task.await {
        Ok(result) => result,
        Err(e) => Err(ListenerError::LaneAborted(e.to_string())),
    }
}

/// Binds a handler to a topic and consumer group and runs one lane per assigned partition.
pub struct ListenerContainer {
    config: ListenerConfig,
    source: Arc<dyn MessageSource>,
    invoker: HandlerInvoker,
    policy: Arc<dyn RetryPolicy>,
    recoverer: Arc<dyn Recoverer>,
    metrics: Arc<ListenerMetrics>,
    lanes: DashMap<i32, LaneHandle>,
}

impl ListenerContainer {
    pub fn new(
        config: ListenerConfig,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn RecordHandler>,
        recoverer: Arc<dyn Recoverer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let policy: Arc<dyn RetryPolicy> = Arc::new(config.retry_policy());
        let invoker = HandlerInvoker::new(handler).with_worker_pool(config.worker_pool_size);

        info!(
            "Registered listener {} on topic {} (group {})",
            config.container_id, config.topic, config.group_id
        );

        Ok(Self {
            config,
            source,
            invoker,
            policy,
            recoverer,
            metrics: Arc::new(ListenerMetrics::default()),
            lanes: DashMap::new(),
        })
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn assigned_partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.lanes.iter().map(|lane| *lane.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn is_running(&self, partition: i32) -> bool {
        self.lanes
            .get(&partition)
            .map(|lane| !lane.task.is_finished())
            .unwrap_or(false)
    }

    // 파티션 할당 콜백. 돌고 있는 레인은 그대로 두고, 이미 멈춘 레인은
    // 종료 결과를 거둔 뒤 새로 시작한다. 거둔 종료 결과를 돌려준다.
    pub async fn on_partitions_assigned(
        &self,
        partitions: &[i32],
    ) -> Vec<(i32, Result<(), ListenerError>)> {
        let mut exits = Vec::new();

        for &partition in partitions {
            let finished = self
                .lanes
                .remove_if(&partition, |_, lane| lane.task.is_finished());
            match finished {
                Some((_, handle)) => {
                    let exit = join_lane(handle).await;
                    self.log_exit(partition, &exit);
                    exits.push((partition, exit));
                }
                None if self.lanes.contains_key(&partition) => continue,
                None => {}
            }

            self.start_lane(partition);
        }

        exits
    }

    fn start_lane(&self, partition: i32) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let lane = PartitionLane::new(
            TopicPartition::new(self.config.topic.clone(), partition),
            self.source.clone(),
            self.invoker.clone(),
            self.policy.clone(),
            self.recoverer.clone(),
            shutdown_rx,
        )
        .with_recovery_failure_mode(self.config.recovery_failure_mode)
        .with_metrics(self.metrics.clone());

        let task = tokio::spawn(lane.run());
        self.lanes.insert(partition, LaneHandle { shutdown_tx, task });
    }

    fn log_exit(&self, partition: i32, exit: &Result<(), ListenerError>) {
        match exit {
            Ok(()) => info!("Lane {}-{} stopped", self.config.topic, partition),
            Err(e) => error!(
                infrastructure = e.is_infrastructure(),
                "Lane {}-{} exited with error: {}", self.config.topic, partition, e
            ),
        }
    }

    // 파티션 해제 콜백. 레인이 끝날 때까지 기다리고 각 레인의 종료 결과를 돌려준다.
    pub async fn on_partitions_revoked(
        &self,
        partitions: &[i32],
    ) -> Vec<(i32, Result<(), ListenerError>)> {
        let handles: Vec<(i32, LaneHandle)> = partitions
            .iter()
            .filter_map(|partition| self.lanes.remove(partition))
            .collect();

        for (_, handle) in &handles {
            // 이미 끝난 레인이면 수신자가 없다
            let _ = handle.shutdown_tx.send(());
        }

        let exits = futures::future::join_all(
            handles
                .into_iter()
                .map(|(partition, handle)| async move { (partition, join_lane(handle).await) }),
        )
        .await;

        for (partition, exit) in &exits {
            self.log_exit(*partition, exit);
        }

        exits
    }

    pub async fn shutdown(&self) -> Vec<(i32, Result<(), ListenerError>)> {
        info!("Shutting down listener {}", self.config.container_id);
        let partitions = self.assigned_partitions();
        self.on_partitions_revoked(&partitions).await
    }
}
