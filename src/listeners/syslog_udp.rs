//! Syslog UDP listener: one datagram per record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::{Listener, MAX_UDP_DATAGRAM_BYTES, STOP_GRACE_PERIOD};
use crate::buffer::IngestionBuffer;
use crate::error::{GrepWiseError, GrepWiseResult};
use crate::parser::syslog::{Rfc3164Parser, Rfc5424Parser};
use crate::parser::{self, Parser, DEFAULT_CLOCK_SKEW_BUDGET_MS};
use crate::sources::SyslogFormat;

pub struct SyslogUdpListener {
    port: u16,
    format: SyslogFormat,
    buffer: Arc<IngestionBuffer>,
    oversized_drops: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyslogUdpListener {
    pub fn new(port: u16, format: SyslogFormat, buffer: Arc<IngestionBuffer>) -> Self {
        Self {
            port,
            format,
            buffer,
            oversized_drops: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn oversized_drops(&self) -> u64 {
        self.oversized_drops.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Listener for SyslogUdpListener {
    async fn start(&self) -> GrepWiseResult<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| GrepWiseError::transient_io(e.to_string()))?;
        let socket = Arc::new(socket);

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let oversized_drops = Arc::clone(&self.oversized_drops);
        let buffer = Arc::clone(&self.buffer);
        let format = self.format;
        let source = format!("syslog:udp:{}", self.port);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_DATAGRAM_BYTES + 1];
            while running.load(Ordering::Relaxed) {
                let recv = tokio::time::timeout(
                    std::time::Duration::from_millis(500),
                    socket.recv_from(&mut buf),
                )
                .await;
                let Ok(Ok((n, _addr))) = recv else { continue };
                if n > MAX_UDP_DATAGRAM_BYTES {
                    oversized_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(bytes = n, "oversized syslog UDP datagram dropped");
                    continue;
                }
                let Ok(text) = std::str::from_utf8(&buf[..n]) else { continue };
                let builder = match format {
                    SyslogFormat::Rfc5424 => Rfc5424Parser.parse(text, &source),
                    SyslogFormat::Rfc3164 => Rfc3164Parser.parse(text, &source),
                };
                let record = parser::finalize(builder, DEFAULT_CLOCK_SKEW_BUDGET_MS);
                buffer.add(record);
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
