//! Syslog RFC5424 and RFC3164 parsers.

use once_cell::sync::Lazy;
use regex::Regex;

use super::Parser;
use crate::record::LogRecordBuilder;

const SEVERITY_NAMES: [&str; 8] =
    ["EMERGENCY", "ALERT", "CRITICAL", "ERROR", "WARN", "NOTICE", "INFO", "DEBUG"];

fn severity_name(pri: u32) -> &'static str {
    let severity = (pri & 0x07) as usize;
    SEVERITY_NAMES[severity]
}

/// `<PRI>1 TIMESTAMP HOST APP PROCID MSGID SD MSG`
static RFC5424: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>1 (?P<ts>\S+) (?P<host>\S+) (?P<app>\S+) (?P<procid>\S+) (?P<msgid>\S+) (?P<sd>(?:-|\[.*?\])) ?(?P<msg>.*)$",
    )
    .unwrap()
});

/// `<PRI>Mon dd HH:MM:SS HOST TAG: MSG`
static RFC3164: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>(?P<mon>[A-Za-z]{3})\s+(?P<day>\d{1,2}) (?P<time>\d{2}:\d{2}:\d{2}) (?P<host>\S+) (?P<tag>[^:]+): ?(?P<msg>.*)$",
    )
    .unwrap()
});

pub struct Rfc5424Parser;

impl Parser for Rfc5424Parser {
    fn parse(&self, input: &str, source: &str) -> LogRecordBuilder {
        let Some(caps) = RFC5424.captures(input) else {
            return super::fallback_record(input, source, "RFC5424 pattern did not match");
        };

        let pri: u32 = caps["pri"].parse().unwrap_or(14);
        let record_time = chrono::DateTime::parse_from_rfc3339(&caps["ts"])
            .ok()
            .map(|dt| dt.timestamp_millis());

        LogRecordBuilder::new(source, input)
            .record_time(record_time)
            .level(severity_name(pri))
            .message(caps["msg"].to_string())
            .metadata("host", &caps["host"])
            .metadata("app", &caps["app"])
            .metadata("procid", &caps["procid"])
            .metadata("msgid", &caps["msgid"])
    }
}

pub struct Rfc3164Parser;

impl Parser for Rfc3164Parser {
    fn parse(&self, input: &str, source: &str) -> LogRecordBuilder {
        let Some(caps) = RFC3164.captures(input) else {
            return super::fallback_record(input, source, "RFC3164 pattern did not match");
        };

        let pri: u32 = caps["pri"].parse().unwrap_or(14);
        let year = chrono::Utc::now().format("%Y").to_string();
        let timestamp_text = format!("{} {} {} {}", caps["mon"].to_string(), &caps["day"], year, &caps["time"]);
        let record_time = chrono::NaiveDateTime::parse_from_str(&timestamp_text, "%b %e %Y %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc().timestamp_millis());

        LogRecordBuilder::new(source, input)
            .record_time(record_time)
            .level(severity_name(pri))
            .message(caps["msg"].to_string())
            .metadata("host", &caps["host"])
            .metadata("app", &caps["tag"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc5424_extracts_structured_fields() {
        let parser = Rfc5424Parser;
        let line = "<34>1 2021-07-01T00:00:00.000Z myhost app 1234 ID47 - login failed";
        let builder = parser.parse(line, "syslog:tcp:514");
        let record = builder.build(0, i64::MAX);
        assert_eq!(record.level, "CRITICAL");
        assert_eq!(record.message, "login failed");
        assert_eq!(record.metadata.get("host").unwrap(), "myhost");
        assert_eq!(record.metadata.get("procid").unwrap(), "1234");
        assert_eq!(record.record_time, Some(1625097600000));
    }

    #[test]
    fn rfc3164_extracts_tag_as_app() {
        let parser = Rfc3164Parser;
        let line = "<13>Jul  1 00:00:00 myhost sshd: session opened";
        let builder = parser.parse(line, "syslog:udp:514");
        let record = builder.build(0, i64::MAX);
        assert_eq!(record.level, "NOTICE");
        assert_eq!(record.message, "session opened");
        assert_eq!(record.metadata.get("app").unwrap(), "sshd");
    }

    #[test]
    fn malformed_input_falls_back() {
        let parser = Rfc5424Parser;
        let record = parser.parse("not syslog at all", "syslog:tcp:514").build(0, i64::MAX);
        assert_eq!(record.level, "UNKNOWN");
    }
}
