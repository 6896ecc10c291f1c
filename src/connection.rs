use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::HubError;
use crate::messages::MonitorFrame;

/// Handle for one browser tab's live socket.
///
/// Frames pushed through `send` are queued on an unbounded channel and
/// drained by a forward task that owns the socket's write half, so sending
/// never blocks the caller.
#[derive(Debug, Clone)]
pub struct BrowserConnection {
    connection_id: String,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<MonitorFrame>,
}

impl BrowserConnection {
    pub fn new(remote_addr: Option<SocketAddr>, tx: mpsc::UnboundedSender<MonitorFrame>) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            remote_addr,
            tx,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn send(&self, frame: MonitorFrame) -> Result<(), HubError> {
        self.tx.send(frame).map_err(|_| HubError::ConnectionClosed)
    }
}
