use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use super::error::ManagerError;
use super::handle::ManagerHandle;

/// Accepts inbound TCP peers and hands them to a connection manager.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    handle: ManagerHandle,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, handle: ManagerHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until the manager stops.
    pub async fn run(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept peer connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, "failed to set nodelay: {}", e);
            }
            if let Err(ManagerError::Closed) = self.handle.accept(stream, addr).await {
                debug!("connection manager closed, listener stopping");
                return;
            }
        }
    }
}
