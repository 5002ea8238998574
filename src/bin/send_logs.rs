//! `send-logs`: administrative CLI that replays a local log file over the
//! syslog wire (spec §6 CLI surface) for load generation and local testing.
//!
//! Exit codes: `0` success, `1` bad arguments, `2` backend unreachable,
//! `3` API error (write failure mid-stream).

use std::fs;
use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "send-logs")]
#[command(about = "Replay a local log file over the syslog wire")]
struct Args {
    /// Destination host
    #[arg(short = 'H', long = "host", value_name = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Destination port
    #[arg(short = 'P', long = "port", value_name = "PORT")]
    port: u16,

    /// Transport protocol
    #[arg(short = 'p', long = "proto", value_name = "TCP|UDP", default_value = "UDP")]
    proto: String,

    /// Path to the file whose lines are replayed, one line per record
    #[arg(short = 's', long = "source-path", value_name = "PATH")]
    source_path: String,

    /// Lines per second; 0 means as fast as possible
    #[arg(short = 'r', long = "rate", value_name = "LINES_PER_SEC", default_value_t = 100)]
    rate: u64,

    /// Number of times to replay the whole file
    #[arg(short = 'l', long = "loops", value_name = "N", default_value_t = 1)]
    loops: u32,

    /// Print what would be sent without opening a connection
    #[arg(short = 'x', long = "dry-run")]
    dry_run: bool,
}

enum Transport {
    Udp(UdpSocket, String),
    Tcp(TcpStream),
}

impl Transport {
    fn connect(host: &str, port: u16, proto: &str) -> std::io::Result<Self> {
        match proto.to_uppercase().as_str() {
            "TCP" => Ok(Transport::Tcp(TcpStream::connect((host, port))?)),
            _ => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.connect((host, port))?;
                Ok(Transport::Udp(socket, format!("{host}:{port}")))
            },
        }
    }

    fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Transport::Udp(socket, _) => {
                socket.send(line.as_bytes())?;
                Ok(())
            },
            Transport::Tcp(stream) => {
                stream.write_all(line.as_bytes())?;
                stream.write_all(b"\n")
            },
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(1);
        },
    };

    if !matches!(args.proto.to_uppercase().as_str(), "TCP" | "UDP") {
        eprintln!("send-logs: unknown protocol `{}`, expected TCP or UDP", args.proto);
        return ExitCode::from(1);
    }

    let content = match fs::read_to_string(&args.source_path) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("send-logs: cannot read `{}`: {err}", args.source_path);
            return ExitCode::from(1);
        },
    };
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        eprintln!("send-logs: `{}` has no non-empty lines", args.source_path);
        return ExitCode::from(1);
    }

    let delay = if args.rate == 0 { Duration::ZERO } else { Duration::from_secs_f64(1.0 / args.rate as f64) };

    if args.dry_run {
        for pass in 0..args.loops {
            for line in &lines {
                println!("[dry-run pass {pass}] {line}");
            }
        }
        println!(
            "dry-run complete: would send {} lines to {}:{} over {}",
            lines.len() as u32 * args.loops,
            args.host,
            args.port,
            args.proto.to_uppercase()
        );
        return ExitCode::SUCCESS;
    }

    let mut transport = match Transport::connect(&args.host, args.port, &args.proto) {
        Ok(t) => t,
        Err(err) => {
            eprintln!("send-logs: backend unreachable at {}:{}: {err}", args.host, args.port);
            return ExitCode::from(2);
        },
    };

    let mut sent = 0u64;
    for _ in 0..args.loops {
        for line in &lines {
            if let Err(err) = transport.send_line(line) {
                eprintln!("send-logs: send failed after {sent} lines: {err}");
                return ExitCode::from(3);
            }
            sent += 1;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    println!("sent {sent} lines to {}:{} over {}", args.host, args.port, args.proto.to_uppercase());
    ExitCode::SUCCESS
}
