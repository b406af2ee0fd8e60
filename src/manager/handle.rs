use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use super::engine::Engine;
use super::error::ManagerError;
use super::event::{EngineEvent, TorrentStatus};
use crate::bitfield::Bitfield;
use crate::connection::{
    AsyncStream, BoxedStream, Connector, EncryptionNegotiator, StreamEncryptionNegotiator,
    TcpConnector,
};
use crate::constants::{COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY};
use crate::message::ExtensionRegistry;
use crate::peer::{Peer, PeerId};
use crate::settings::{EngineSettings, TorrentSettings};
use crate::storage::PieceWriter;
use crate::torrent::{Priority, TorrentInfo};

/// Vetoes outbound and inbound peers. Returning `true` bans the peer.
pub type BanFilter = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;

pub(crate) enum Command {
    AddTorrent {
        info: TorrentInfo,
        settings: TorrentSettings,
        writer: Arc<dyn PieceWriter>,
        have: Option<Bitfield>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    AddPeers {
        info_hash: [u8; 20],
        peers: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<usize, ManagerError>>,
    },
    Accept {
        stream: BoxedStream,
        addr: SocketAddr,
    },
    SetFilePriority {
        info_hash: [u8; 20],
        file: usize,
        priority: Priority,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    StartTorrent {
        info_hash: [u8; 20],
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    StopTorrent {
        info_hash: [u8; 20],
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    HashCheck {
        info_hash: [u8; 20],
        auto_start: bool,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Status {
        info_hash: [u8; 20],
        reply: oneshot::Sender<Result<TorrentStatus, ManagerError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Configures and starts a connection manager.
///
/// ```no_run
/// use peerwire::{EngineSettings, ManagerBuilder};
///
/// # async fn example() {
/// let handle = ManagerBuilder::new(EngineSettings::default())
///     .ban_filter(|peer| peer.addr.ip().is_loopback())
///     .spawn();
/// let mut events = handle.subscribe();
/// # }
/// ```
pub struct ManagerBuilder {
    pub(super) settings: EngineSettings,
    pub(super) peer_id: Option<PeerId>,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) negotiator: Arc<dyn EncryptionNegotiator>,
    pub(super) registry: ExtensionRegistry,
    pub(super) ban_filter: Option<BanFilter>,
}

impl ManagerBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            peer_id: None,
            connector: Arc::new(TcpConnector::default()),
            negotiator: Arc::new(StreamEncryptionNegotiator),
            registry: ExtensionRegistry::default(),
            ban_filter: None,
        }
    }

    /// Uses a fixed peer id instead of a random one.
    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn negotiator(mut self, negotiator: impl EncryptionNegotiator + 'static) -> Self {
        self.negotiator = Arc::new(negotiator);
        self
    }

    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn ban_filter(mut self, filter: impl Fn(&Peer) -> bool + Send + Sync + 'static) -> Self {
        self.ban_filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn build(self) -> (Engine, ManagerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let peer_id = self.peer_id.unwrap_or_else(PeerId::generate);

        let handle = ManagerHandle {
            commands: command_tx,
            events: events.clone(),
            peer_id,
        };
        let engine = Engine::new(self, peer_id, command_rx, events);
        (engine, handle)
    }

    /// Starts the manager on the current tokio runtime.
    pub fn spawn(self) -> ManagerHandle {
        let (engine, handle) = self.build();
        tokio::spawn(engine.run());
        handle
    }
}

impl std::fmt::Debug for ManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerBuilder")
            .field("settings", &self.settings)
            .field("peer_id", &self.peer_id)
            .field("registry", &self.registry)
            .field("ban_filter", &self.ban_filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Cloneable front end of a running connection manager.
///
/// Every call is a message to the manager task. Once that task has stopped
/// every call fails with [`ManagerError::Closed`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    peer_id: PeerId,
}

impl ManagerHandle {
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Registers a torrent and starts it. `have` marks pieces already
    /// verified on storage; a complete torrent starts out seeding.
    pub async fn add_torrent(
        &self,
        info: TorrentInfo,
        settings: TorrentSettings,
        writer: Arc<dyn PieceWriter>,
        have: Option<Bitfield>,
    ) -> Result<(), ManagerError> {
        self.call(|reply| Command::AddTorrent {
            info,
            settings,
            writer,
            have,
            reply,
        })
        .await?
    }

    /// Adds candidate peers. Returns how many were new.
    pub async fn add_peers(
        &self,
        info_hash: [u8; 20],
        peers: impl IntoIterator<Item = SocketAddr>,
    ) -> Result<usize, ManagerError> {
        let peers = peers.into_iter().collect();
        self.call(|reply| Command::AddPeers {
            info_hash,
            peers,
            reply,
        })
        .await?
    }

    /// Hands an inbound transport to the manager.
    pub async fn accept(
        &self,
        stream: impl AsyncStream + 'static,
        addr: SocketAddr,
    ) -> Result<(), ManagerError> {
        self.commands
            .send(Command::Accept {
                stream: Box::new(stream),
                addr,
            })
            .await
            .map_err(|_| ManagerError::Closed)
    }

    pub async fn set_file_priority(
        &self,
        info_hash: [u8; 20],
        file: usize,
        priority: Priority,
    ) -> Result<(), ManagerError> {
        self.call(|reply| Command::SetFilePriority {
            info_hash,
            file,
            priority,
            reply,
        })
        .await?
    }

    pub async fn start_torrent(&self, info_hash: [u8; 20]) -> Result<(), ManagerError> {
        self.call(|reply| Command::StartTorrent { info_hash, reply })
            .await?
    }

    /// Stops a torrent and closes its connections. Known peers are kept for
    /// a later start.
    pub async fn stop_torrent(&self, info_hash: [u8; 20]) -> Result<(), ManagerError> {
        self.call(|reply| Command::StopTorrent { info_hash, reply })
            .await?
    }

    /// Re-verifies every piece on storage. The torrent must be stopped; it
    /// reports [`Mode::Hashing`](crate::Mode::Hashing) until the check ends
    /// and then starts if `auto_start` is set, or returns to stopped.
    pub async fn hash_check(&self, info_hash: [u8; 20], auto_start: bool) -> Result<(), ManagerError> {
        self.call(|reply| Command::HashCheck {
            info_hash,
            auto_start,
            reply,
        })
        .await?
    }

    pub async fn status(&self, info_hash: [u8; 20]) -> Result<TorrentStatus, ManagerError> {
        self.call(|reply| Command::Status { info_hash, reply })
            .await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Closes every connection and stops the manager task.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}
