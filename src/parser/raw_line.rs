//! Raw file-line parser used by the File Scanner.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Parser;
use crate::record::LogRecordBuilder;

const LEVELS: [&str; 5] = ["ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

static ISO8601: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)").unwrap()
});

static COMMON_DATETIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d{1,3})?)").unwrap());

static EPOCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{10,13})\b").unwrap());

/// Parses a single appended line from a watched file.
///
/// Timestamp extraction tries, in order: ISO-8601, the common
/// `yyyy-MM-dd HH:mm:ss[.SSS]` form, then a bare epoch. The level is the
/// first whitespace-delimited token matching `ERROR|WARN|INFO|DEBUG|TRACE`.
/// `message` is the line with the leading timestamp/level stripped;
/// `raw_content` is always the untouched original line.
pub struct RawLineParser;

impl RawLineParser {
    fn extract_record_time(&self, line: &str) -> Option<(i64, usize)> {
        if let Some(caps) = ISO8601.captures(line) {
            let matched = caps.get(1).unwrap();
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(matched.as_str()) {
                return Some((dt.timestamp_millis(), matched.end()));
            }
        }
        if let Some(caps) = COMMON_DATETIME.captures(line) {
            let matched = caps.get(1).unwrap();
            let text = matched.as_str();
            let parsed = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"));
            if let Ok(ndt) = parsed {
                return Some((ndt.and_utc().timestamp_millis(), matched.end()));
            }
        }
        if let Some(caps) = EPOCH.captures(line) {
            let matched = caps.get(1).unwrap();
            if let Ok(ts) = matched.as_str().parse::<i64>() {
                let ts = if matched.as_str().len() <= 10 { ts * 1000 } else { ts };
                return Some((ts, matched.end()));
            }
        }
        None
    }

    fn extract_level(&self, line: &str) -> Option<(&'static str, usize, usize)> {
        for token in LEVELS {
            if let Some(pos) = line.find(token) {
                let is_boundary_before =
                    pos == 0 || !line.as_bytes()[pos - 1].is_ascii_alphanumeric();
                let end = pos + token.len();
                let is_boundary_after =
                    end >= line.len() || !line.as_bytes()[end].is_ascii_alphanumeric();
                if is_boundary_before && is_boundary_after {
                    return Some((token, pos, end));
                }
            }
        }
        None
    }
}

impl Parser for RawLineParser {
    fn parse(&self, input: &str, source: &str) -> LogRecordBuilder {
        let mut builder = LogRecordBuilder::new(source, input);

        let after_timestamp: String = match self.extract_record_time(input) {
            Some((ts, end)) => {
                builder = builder.record_time(Some(ts));
                input[end..].trim_start_matches([' ', '-', ':']).to_string()
            },
            None => input.to_string(),
        };

        let (level, message) = match self.extract_level(&after_timestamp) {
            Some((level, start, end)) => {
                let before = &after_timestamp[..start];
                let after = &after_timestamp[end..];
                (level, format!("{}{}", before.trim_end(), after))
            },
            None => ("INFO", after_timestamp),
        };

        builder.level(level).message(message.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_iso8601_timestamp_and_level() {
        let parser = RawLineParser;
        let builder =
            parser.parse("2021-07-01T00:00:00Z ERROR something broke", "file:/a.log");
        let record = builder.build(0, i64::MAX);
        assert_eq!(record.record_time, Some(1625097600000));
        assert_eq!(record.level, "ERROR");
        assert!(record.message.contains("something broke"));
    }

    #[test]
    fn falls_back_to_info_when_no_level_token() {
        let parser = RawLineParser;
        let builder = parser.parse("2021-07-01 00:00:00 plain message", "file:/a.log");
        let record = builder.build(0, i64::MAX);
        assert_eq!(record.level, "INFO");
    }

    #[test]
    fn unparseable_line_keeps_full_text_as_message() {
        let parser = RawLineParser;
        let builder = parser.parse("no timestamp here at all", "file:/a.log");
        let record = builder.build(0, i64::MAX);
        assert_eq!(record.record_time, None);
        assert_eq!(record.message, "no timestamp here at all");
    }
}
