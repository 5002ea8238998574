//! HTTP intake JSON payload parser.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::record::LogRecordBuilder;

/// Body shape accepted by `POST /api/logs/{sourceId}` and the batch
/// variant. Missing `level` defaults to `INFO`; missing `timestamp` is left
/// `None` (the Index Engine then falls back to `ingestTime`).
#[derive(Debug, Clone, Deserialize)]
pub struct LogRequest {
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub raw_content: Option<String>,
}

pub fn parse_http_log_request(req: &LogRequest, source: &str) -> LogRecordBuilder {
    let raw_content = req.raw_content.clone().unwrap_or_else(|| req.message.clone());
    LogRecordBuilder::new(source, raw_content)
        .record_time(req.timestamp)
        .level(req.level.clone().unwrap_or_else(|| "INFO".to_string()))
        .message(req.message.clone())
        .metadata_map(req.metadata.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_level_defaults_to_info() {
        let req = LogRequest {
            message: "hello".to_string(),
            timestamp: None,
            level: None,
            metadata: BTreeMap::new(),
            raw_content: None,
        };
        let record = parse_http_log_request(&req, "http:src1").build(1000, i64::MAX);
        assert_eq!(record.level, "INFO");
        assert_eq!(record.record_time, None);
    }

    #[test]
    fn explicit_timestamp_and_level_preserved() {
        let req = LogRequest {
            message: "boom".to_string(),
            timestamp: Some(1625097600000),
            level: Some("ERROR".to_string()),
            metadata: BTreeMap::from([("k".to_string(), "v".to_string())]),
            raw_content: Some("raw boom".to_string()),
        };
        let record = parse_http_log_request(&req, "http:src1").build(1625097700000, i64::MAX);
        assert_eq!(record.level, "ERROR");
        assert_eq!(record.record_time, Some(1625097600000));
        assert_eq!(record.raw_content, "raw boom");
        assert_eq!(record.metadata.get("k").unwrap(), "v");
    }
}
