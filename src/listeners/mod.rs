//! Network listeners: syslog UDP/TCP and the HTTP intake receiver.

pub mod http_intake;
pub mod syslog_tcp;
pub mod syslog_udp;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GrepWiseResult;

pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const MAX_UDP_DATAGRAM_BYTES: usize = 64 * 1024;
pub const TCP_CONNECTION_QUEUE_SIZE: usize = 1024;
pub const TCP_SLOW_CONSUMER_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle contract every listener satisfies: `start` binds resources,
/// `stop` closes them and joins worker tasks within [`STOP_GRACE_PERIOD`].
#[async_trait]
pub trait Listener: Send + Sync {
    async fn start(&self) -> GrepWiseResult<()>;
    async fn stop(&self) -> GrepWiseResult<()>;
}
