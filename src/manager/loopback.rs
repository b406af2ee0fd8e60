use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::ManagerHandle;
use crate::connection::{BoxFuture, BoxedStream, Connector};

const LOOPBACK_BUFFER: usize = 64 * 1024;

/// An in-process network of managers, addressed by made-up socket
/// addresses.
///
/// Connecting to a registered address hands one end of an in-memory pipe
/// to that manager as an inbound connection.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<SocketAddr, ManagerHandle>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: SocketAddr, handle: ManagerHandle) {
        self.peers.lock().insert(addr, handle);
    }

    /// A connector for the manager reachable at `local_addr`.
    pub fn connector(&self, local_addr: SocketAddr) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            local_addr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    local_addr: SocketAddr,
}

impl Connector for LoopbackConnector {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let handle = self.network.peers.lock().get(&addr).cloned();
        let local_addr = self.local_addr;
        Box::pin(async move {
            let handle = handle.ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "no peer at address")
            })?;
            let (ours, theirs) = tokio::io::duplex(LOOPBACK_BUFFER);
            handle
                .accept(theirs, local_addr)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
            Ok(Box::new(ours) as BoxedStream)
        })
    }
}
