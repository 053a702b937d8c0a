use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Headers;

// DLT 레코드 헤더 이름. 값은 모두 UTF-8 텍스트다.
pub const ORIGINAL_TOPIC: &str = "original-topic";
pub const ORIGINAL_PARTITION: &str = "original-partition";
pub const ORIGINAL_OFFSET: &str = "original-offset";
pub const ORIGINAL_TIMESTAMP: &str = "original-timestamp";
pub const ORIGINAL_CONSUMER_GROUP: &str = "original-consumer-group";
pub const FAILURE_REASON: &str = "failure-reason";
pub const ATTEMPTS_MADE: &str = "attempts-made";
pub const RECOVERED_AT: &str = "recovered-at";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },
}

/// Metadata a dead-lettered record carries next to its untouched payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DltHeaders {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub original_timestamp: DateTime<Utc>,
    pub consumer_group: Option<String>,
    pub failure_reason: String,
    pub attempts_made: u32,
    pub recovered_at: DateTime<Utc>,
}

impl DltHeaders {
    pub fn write_to(&self, headers: &mut Headers) {
        headers.append(ORIGINAL_TOPIC, self.original_topic.clone());
        headers.append(ORIGINAL_PARTITION, self.original_partition.to_string());
        headers.append(ORIGINAL_OFFSET, self.original_offset.to_string());
        headers.append(ORIGINAL_TIMESTAMP, self.original_timestamp.to_rfc3339());
        if let Some(group) = &self.consumer_group {
            headers.append(ORIGINAL_CONSUMER_GROUP, group.clone());
        }
        headers.append(FAILURE_REASON, self.failure_reason.clone());
        headers.append(ATTEMPTS_MADE, self.attempts_made.to_string());
        headers.append(RECOVERED_AT, self.recovered_at.to_rfc3339());
    }

    pub fn from_headers(headers: &Headers) -> Result<Self, ProtocolError> {
        Ok(Self {
            original_topic: required(headers, ORIGINAL_TOPIC)?.to_string(),
            original_partition: parse(headers, ORIGINAL_PARTITION)?,
            original_offset: parse(headers, ORIGINAL_OFFSET)?,
            original_timestamp: parse_time(headers, ORIGINAL_TIMESTAMP)?,
            consumer_group: headers.get_str(ORIGINAL_CONSUMER_GROUP).map(str::to_string),
            failure_reason: required(headers, FAILURE_REASON)?.to_string(),
            attempts_made: parse(headers, ATTEMPTS_MADE)?,
            recovered_at: parse_time(headers, RECOVERED_AT)?,
        })
    }
}

fn required<'a>(headers: &'a Headers, name: &'static str) -> Result<&'a str, ProtocolError> {
    match headers.get(name) {
        None => Err(ProtocolError::MissingHeader(name)),
        Some(raw) => std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidHeader {
            name,
            value: String::from_utf8_lossy(raw).into_owned(),
        }),
    }
}

fn parse<T: std::str::FromStr>(headers: &Headers, name: &'static str) -> Result<T, ProtocolError> {
    let raw = required(headers, name)?;
    raw.parse().map_err(|_| ProtocolError::InvalidHeader {
        name,
        value: raw.to_string(),
    })
}

fn parse_time(headers: &Headers, name: &'static str) -> Result<DateTime<Utc>, ProtocolError> {
    let raw = required(headers, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ProtocolError::InvalidHeader {
            name,
            value: raw.to_string(),
        })
}
