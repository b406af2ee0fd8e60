use std::fmt;

use crate::peer::Peer;

/// What a torrent is currently doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Stopped,
    /// Verifying data already on disk before anything is exchanged.
    Hashing,
    Downloading,
    Seeding,
    /// Super-seeding: pieces are revealed to each peer one at a time until
    /// every piece is known to exist elsewhere in the swarm.
    InitialSeeding,
    /// Storage failed; the torrent stays here until it is removed.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEvent {
    Start {
        complete: bool,
        initial_seeding: bool,
    },
    /// Re-verify the data on disk.
    Check,
    Completed,
    Stop,
    Failed(String),
}

impl Mode {
    pub fn transition(&self, event: ModeEvent) -> Mode {
        match (self, event) {
            (Mode::Error(reason), _) => Mode::Error(reason.clone()),
            (_, ModeEvent::Failed(reason)) => Mode::Error(reason),
            (_, ModeEvent::Stop) => Mode::Stopped,
            (Mode::Stopped, ModeEvent::Check) => Mode::Hashing,
            (
                Mode::Stopped | Mode::Hashing,
                ModeEvent::Start {
                    complete,
                    initial_seeding,
                },
            ) => match (complete, initial_seeding) {
                (true, true) => Mode::InitialSeeding,
                (true, false) => Mode::Seeding,
                (false, _) => Mode::Downloading,
            },
            (Mode::Downloading | Mode::InitialSeeding, ModeEvent::Completed) => Mode::Seeding,
            (mode, _) => mode.clone(),
        }
    }

    pub fn can_accept_connections(&self) -> bool {
        matches!(
            self,
            Mode::Downloading | Mode::Seeding | Mode::InitialSeeding
        )
    }

    /// Whether an outbound connection to `peer` is worth making.
    pub fn should_connect(&self, peer: &Peer) -> bool {
        match self {
            Mode::Downloading => true,
            Mode::Seeding | Mode::InitialSeeding => !peer.is_seeder,
            Mode::Stopped | Mode::Hashing | Mode::Error(_) => false,
        }
    }

    pub fn is_downloading(&self) -> bool {
        *self == Mode::Downloading
    }

    /// Whether we only upload, so the choker ranks by what we sent.
    pub fn is_seeding(&self) -> bool {
        matches!(self, Mode::Seeding | Mode::InitialSeeding)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Stopped => f.write_str("stopped"),
            Mode::Hashing => f.write_str("hashing"),
            Mode::Downloading => f.write_str("downloading"),
            Mode::Seeding => f.write_str("seeding"),
            Mode::InitialSeeding => f.write_str("initial seeding"),
            Mode::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}
