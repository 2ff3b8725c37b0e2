//! Lifecycle notifications.
//!
//! Events travel over an unbounded [`mpsc`] channel so a slow consumer can
//! never stall a bridge's setup thread, its relay threads or its teardown.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique bridge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(u64);

impl BridgeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bridge-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The local endpoint is bound; a local client may connect to `port`.
    Listening { bridge: BridgeId, port: u16 },
    /// Bytes now flow in both directions.
    RelayStarted { bridge: BridgeId },
    /// The bridge failed and tore itself down.
    Disconnected { bridge: BridgeId, reason: String },
}

impl BridgeEvent {
    #[must_use]
    pub fn bridge(&self) -> BridgeId {
        match self {
            Self::Listening { bridge, .. }
            | Self::RelayStarted { bridge }
            | Self::Disconnected { bridge, .. } => *bridge,
        }
    }
}

/// Sending half of a bridge event channel. Cheap to clone; one sink may
/// serve many bridges.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<BridgeEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        if let Err(mpsc::SendError(event)) = self.tx.send(event) {
            tracing::debug!(bridge = %event.bridge(), ?event, "event receiver dropped");
        }
    }
}

/// Create a connected sink/receiver pair.
pub fn event_channel() -> (EventSink, mpsc::Receiver<BridgeEvent>) {
    let (tx, rx) = mpsc::channel();
    (EventSink::new(tx), rx)
}
