//! Syslog TCP listener: newline-terminated framing.
//!
//! Adopts newline framing per spec; RFC6587 octet-counted framing is not
//! implemented here and is a documented extension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Listener, STOP_GRACE_PERIOD, TCP_CONNECTION_QUEUE_SIZE, TCP_SLOW_CONSUMER_TIMEOUT};
use crate::buffer::IngestionBuffer;
use crate::error::{GrepWiseError, GrepWiseResult};
use crate::parser::syslog::{Rfc3164Parser, Rfc5424Parser};
use crate::parser::{self, Parser, DEFAULT_CLOCK_SKEW_BUDGET_MS};
use crate::sources::SyslogFormat;

pub struct SyslogTcpListener {
    port: u16,
    format: SyslogFormat,
    buffer: Arc<IngestionBuffer>,
    running: Arc<AtomicBool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyslogTcpListener {
    pub fn new(port: u16, format: SyslogFormat, buffer: Arc<IngestionBuffer>) -> Self {
        Self {
            port,
            format,
            buffer,
            running: Arc::new(AtomicBool::new(false)),
            handle: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Listener for SyslogTcpListener {
    async fn start(&self) -> GrepWiseResult<()> {
        let listener = TokioTcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| GrepWiseError::transient_io(e.to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let buffer = Arc::clone(&self.buffer);
        let format = self.format;
        let source = format!("syslog:tcp:{}", self.port);

        let task = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                let accepted =
                    timeout(std::time::Duration::from_millis(500), listener.accept()).await;
                let Ok(Ok((stream, _addr))) = accepted else { continue };
                let buffer = Arc::clone(&buffer);
                let source = source.clone();
                tokio::spawn(handle_connection(stream, format, source, buffer));
            }
        });

        *self.handle.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> GrepWiseResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, handle).await;
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    format: SyslogFormat,
    source: String,
    buffer: Arc<IngestionBuffer>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(TCP_CONNECTION_QUEUE_SIZE);
    let drain_buffer = Arc::clone(&buffer);
    let drain_source = source.clone();
    let drain = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let builder = match format {
                SyslogFormat::Rfc5424 => Rfc5424Parser.parse(&line, &drain_source),
                SyslogFormat::Rfc3164 => Rfc3164Parser.parse(&line, &drain_source),
            };
            let record = parser::finalize(builder, DEFAULT_CLOCK_SKEW_BUDGET_MS);
            drain_buffer.add(record);
        }
    });

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                match timeout(TCP_SLOW_CONSUMER_TIMEOUT, tx.send(line)).await {
                    Ok(Ok(())) => {},
                    _ => {
                        tracing::warn!("slow TCP syslog consumer, closing connection");
                        break;
                    },
                }
            },
            _ => break,
        }
    }

    drop(tx);
    let _ = drain.await;
}
