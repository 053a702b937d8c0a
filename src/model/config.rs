use std::path::Path;
use std::time::Duration;

use kafka_dlt_pipeline::{ListenerConfig, RecoveryFailureMode};
use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
}

// 샘플 애플리케이션 설정. 파일이 없으면 기본값을 쓴다.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub topic: String,
    pub partitions: i32,
    pub group_id: String,
    pub dlt_group_id: String,
    pub dlt_template: String,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    pub worker_pool_size: usize,
    // true면 DLT 발행 실패 시 레인을 멈추지 않고 계속 재발행한다
    pub republish_dead_letters: bool,
    pub sample_payloads: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            topic: "topic1".to_string(),
            partitions: 1,
            group_id: "fooGroup".to_string(),
            dlt_group_id: "dltGroup".to_string(),
            dlt_template: "{topic}-dlt".to_string(),
            retry_delay_ms: 1_000,
            max_attempts: 2,
            worker_pool_size: 4,
            republish_dead_letters: false,
            sample_payloads: vec![
                r#"{"foo":"bar"}"#.to_string(),
                r#"{"foo":"fail-test"}"#.to_string(),
            ],
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> Result<Self, AppConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn log_level(&self) -> Result<Level, AppConfigError> {
        self.log_level
            .parse()
            .map_err(|_| AppConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mode = if self.republish_dead_letters {
            RecoveryFailureMode::RetryForever {
                initial: Duration::from_millis(self.retry_delay_ms.max(1)),
                max: Duration::from_secs(60),
            }
        } else {
            RecoveryFailureMode::Halt
        };

        ListenerConfig::new(self.topic.clone(), self.group_id.clone())
            .with_container_id(self.group_id.clone())
            .with_retry(Duration::from_millis(self.retry_delay_ms), self.max_attempts)
            .with_dlt_template(self.dlt_template.clone())
            .with_recovery_failure_mode(mode)
            .with_worker_pool_size(self.worker_pool_size)
    }

    // DLT 리스너는 재시도 없이 바로 넘긴다
    pub fn dlt_listener_config(&self, dlt_topic: &str) -> ListenerConfig {
        ListenerConfig::new(dlt_topic, self.dlt_group_id.clone())
            .with_container_id(self.dlt_group_id.clone())
            .with_retry(Duration::ZERO, 0)
    }
}
