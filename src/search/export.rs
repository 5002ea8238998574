//! CSV/JSON export.

use chrono::{SecondsFormat, TimeZone, Utc};

use crate::error::{GrepWiseError, GrepWiseResult};
use crate::record::LogRecord;

/// RFC 4180 CSV with header `ID,Timestamp,DateTime,Level,Source,Message,RawContent`.
pub fn export_csv(records: &[LogRecord]) -> GrepWiseResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["ID", "Timestamp", "DateTime", "Level", "Source", "Message", "RawContent"])
        .map_err(|e| GrepWiseError::fatal(format!("csv header write failed: {e}")))?;

    for record in records {
        let ts = record.effective_time();
        let datetime = Utc
            .timestamp_millis_opt(ts)
            .single()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        writer
            .write_record([
                record.id.as_str(),
                &ts.to_string(),
                &datetime,
                record.level.as_str(),
                record.source.as_str(),
                record.message.as_str(),
                record.raw_content.as_str(),
            ])
            .map_err(|e| GrepWiseError::fatal(format!("csv row write failed: {e}")))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| GrepWiseError::fatal(format!("csv flush failed: {e}")))?;
    String::from_utf8(bytes).map_err(|e| GrepWiseError::fatal(format!("csv is not valid utf8: {e}")))
}

pub fn export_json(records: &[LogRecord]) -> serde_json::Value {
    serde_json::json!(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogRecordBuilder;

    #[test]
    fn csv_includes_header_and_escapes_commas() {
        let record = LogRecordBuilder::new("s", "a, b").message("a, b").build(1, i64::MAX);
        let csv = export_csv(&[record]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "ID,Timestamp,DateTime,Level,Source,Message,RawContent"
        );
        assert!(lines.next().unwrap().contains("\"a, b\""));
    }

    #[test]
    fn json_export_round_trips_record_count() {
        let records = vec![
            LogRecordBuilder::new("s", "a").build(1, i64::MAX),
            LogRecordBuilder::new("s", "b").build(2, i64::MAX),
        ];
        let value = export_json(&records);
        assert_eq!(value.as_array().unwrap().len(), 2);
    }
}
