use std::io;

use crate::net::{HandlerId, PacketKind, PeerId};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("could not resolve host \"{0}\"")]
    Resolve(String),
    #[error("host is not started")]
    NotStarted,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("packet overflowed after {size} bytes (limit {limit})")]
    PacketOverflow { size: usize, limit: usize },
    #[error("no free request slot ({0} in use)")]
    RequestPoolExhausted(usize),
    #[error("already waiting for {kind} from {peer}")]
    DuplicateRequest { peer: PeerId, kind: PacketKind },
    #[error("connection registry full ({0} entries)")]
    RegistryFull(usize),
    #[error("handler {0} is not registered")]
    UnknownHandler(HandlerId),
    #[error("worker thread failed to start: {0}")]
    Thread(io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result of blocking on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The reply arrived; holds the number of bytes copied out.
    Received(usize),
    Timeout,
}

/// Result of a logon attempt, as reported to the menu layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Accepted { session_id: u8 },
    Refused,
    Unreachable,
    TimedOut,
}

impl JoinOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Unreachable | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Refused => "refused",
            Self::Unreachable => "could not connect",
            Self::TimedOut => "timed out",
        }
    }
}
