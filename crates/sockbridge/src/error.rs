use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Direction of one relay copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayDirection {
    RemoteToLocal,
    LocalToRemote,
}

impl RelayDirection {
    /// Side the direction reads from.
    #[must_use]
    pub fn source(self) -> &'static str {
        match self {
            Self::RemoteToLocal => "remote channel",
            Self::LocalToRemote => "local socket",
        }
    }

    #[must_use]
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::RemoteToLocal => "remote-to-local",
            Self::LocalToRemote => "local-to-remote",
        }
    }
}

impl fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fatal bridge conditions. Each one ends up as a single disconnection
/// event whose reason is the `Display` text.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to create a server socket instance: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to accept a local connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to create local streams: {0}")]
    StreamAcquisition(#[source] io::Error),

    #[error("failed to connect to local port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("{direction} relay failed: {source}")]
    Relay {
        direction: RelayDirection,
        #[source]
        source: io::Error,
    },

    #[error("{} closed the connection", .direction.source())]
    PeerClosed { direction: RelayDirection },

    #[error("bridge is closed")]
    Closed,

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl BridgeError {
    /// True when the error only reflects that teardown already happened.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reason_carries_cause() {
        let error = BridgeError::Bind(io::Error::new(io::ErrorKind::AddrInUse, "port taken"));
        assert_eq!(
            error.to_string(),
            "failed to create a server socket instance: port taken"
        );
    }

    #[test]
    fn peer_closed_names_the_reading_side() {
        let error = BridgeError::PeerClosed {
            direction: RelayDirection::RemoteToLocal,
        };
        assert_eq!(error.to_string(), "remote channel closed the connection");
        let error = BridgeError::PeerClosed {
            direction: RelayDirection::LocalToRemote,
        };
        assert_eq!(error.to_string(), "local socket closed the connection");
    }

    #[test]
    fn relay_reason_includes_direction() {
        let error = BridgeError::Relay {
            direction: RelayDirection::LocalToRemote,
            source: io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        };
        assert_eq!(error.to_string(), "local-to-remote relay failed: pipe");
    }

    #[test]
    fn only_closed_reports_is_closed() {
        assert!(BridgeError::Closed.is_closed());
        assert!(!BridgeError::Accept(io::Error::other("x")).is_closed());
    }
}
