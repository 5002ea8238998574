//! `enable-syslog`: administrative CLI that creates or updates a syslog
//! `LogSource` on a running GrepWise backend (spec §6 CLI surface).
//!
//! Exit codes: `0` success, `1` bad arguments, `2` backend unreachable,
//! `3` API error (non-2xx response).

use std::process::ExitCode;

use clap::Parser;
use grepwise_core::sources::{LogSource, SourceKind, SyslogFormat, SyslogProto};

#[derive(Parser, Debug)]
#[command(name = "enable-syslog")]
#[command(about = "Create or update a syslog LogSource on a GrepWise backend")]
struct Args {
    /// Backend base URL, e.g. http://localhost:8088
    #[arg(short = 'H', long = "host", value_name = "BASE_URL", default_value = "http://localhost:8088")]
    base_url: String,

    /// Syslog listener port
    #[arg(short = 'P', long = "port", value_name = "PORT")]
    port: u16,

    /// Transport protocol
    #[arg(short = 'p', long = "proto", value_name = "TCP|UDP", default_value = "UDP")]
    proto: String,

    /// Wire format
    #[arg(short = 'f', long = "format", value_name = "RFC5424|RFC3164", default_value = "RFC5424")]
    format: String,

    /// Source id; defaults to `syslog-<port>`
    #[arg(short = 'i', long = "id", value_name = "ID")]
    id: Option<String>,

    /// Source display name; defaults to the id
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Create the source disabled instead of starting it immediately
    #[arg(short = 'S', long = "skip-start")]
    skip_start: bool,
}

fn parse_proto(s: &str) -> Result<SyslogProto, String> {
    match s.to_uppercase().as_str() {
        "TCP" => Ok(SyslogProto::Tcp),
        "UDP" => Ok(SyslogProto::Udp),
        other => Err(format!("unknown protocol `{other}`, expected TCP or UDP")),
    }
}

fn parse_format(s: &str) -> Result<SyslogFormat, String> {
    match s.to_uppercase().as_str() {
        "RFC5424" => Ok(SyslogFormat::Rfc5424),
        "RFC3164" => Ok(SyslogFormat::Rfc3164),
        other => Err(format!("unknown format `{other}`, expected RFC5424 or RFC3164")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        },
    };

    let proto = match parse_proto(&args.proto) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("enable-syslog: {msg}");
            return ExitCode::from(1);
        },
    };
    let format = match parse_format(&args.format) {
        Ok(f) => f,
        Err(msg) => {
            eprintln!("enable-syslog: {msg}");
            return ExitCode::from(1);
        },
    };

    let id = args.id.clone().unwrap_or_else(|| format!("syslog-{}", args.port));
    let name = args.name.clone().unwrap_or_else(|| id.clone());

    let source = LogSource {
        id: id.clone(),
        name,
        enabled: !args.skip_start,
        kind: SourceKind::Syslog,
        directory: None,
        glob: None,
        recursive: false,
        port: Some(args.port),
        proto: Some(proto),
        format: Some(format),
        require_auth: false,
        token: None,
    };

    let url = format!("{}/api/sources", args.base_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let response = match client.post(&url).json(&source).send().await {
        Ok(resp) => resp,
        Err(err) => {
            eprintln!("enable-syslog: backend unreachable at {url}: {err}");
            return ExitCode::from(2);
        },
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        eprintln!("enable-syslog: API error {status}: {body}");
        return ExitCode::from(3);
    }

    println!(
        "enabled syslog source `{id}` on port {} ({:?}/{:?}){}",
        args.port,
        proto,
        format,
        if args.skip_start { ", created disabled" } else { "" }
    );
    ExitCode::SUCCESS
}
