//! Parsers that turn one input unit into a `LogRecord`.
//!
//! Parse failures never drop the input: callers fall back to
//! [`fallback_record`], which stores the raw content verbatim with
//! `level = "UNKNOWN"` and a `parse.error` metadata entry.

pub mod http_payload;
pub mod raw_line;
pub mod syslog;

use crate::record::{LogRecord, LogRecordBuilder, now_millis};

/// Default budget for how far `recordTime` may sit ahead of `ingestTime`
/// before it is treated as unparseable.
pub const DEFAULT_CLOCK_SKEW_BUDGET_MS: i64 = 5 * 60 * 1000;

/// A source-specific parser. Implementors never error: on failure they
/// return a builder already carrying `parse.error` metadata.
pub trait Parser {
    fn parse(&self, input: &str, source: &str) -> LogRecordBuilder;
}

/// Finalize a builder into a `LogRecord`, stamping `ingest_time` with the
/// system clock and applying the clock-skew budget.
pub fn finalize(builder: LogRecordBuilder, clock_skew_budget_ms: i64) -> LogRecord {
    builder.build(now_millis(), clock_skew_budget_ms)
}

/// Construct the fallback record for an unparseable line: the record is
/// stored, never dropped, with `message = raw_content` and the error reason
/// noted.
pub fn fallback_record(raw_content: &str, source: &str, reason: &str) -> LogRecordBuilder {
    LogRecordBuilder::new(source, raw_content)
        .level("UNKNOWN")
        .message(raw_content)
        .metadata("parse.error", reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_record_preserves_raw_content() {
        let builder = fallback_record("garbled #!@", "file:/x.log", "no timestamp pattern matched");
        let record = finalize(builder, DEFAULT_CLOCK_SKEW_BUDGET_MS);
        assert_eq!(record.level, "UNKNOWN");
        assert_eq!(record.message, "garbled #!@");
        assert_eq!(record.raw_content, "garbled #!@");
        assert_eq!(record.metadata.get("parse.error").unwrap(), "no timestamp pattern matched");
    }
}
