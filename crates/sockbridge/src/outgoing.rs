//! Bridge that listens for exactly one local client.
//!
//! ```text
//! Init -> Listening -> Accepted -> Relaying
//!    \         \           \
//!     +---------+-----------+--> Failed / Closed
//! ```
//!
//! The setup thread binds an ephemeral loopback port, reports it, blocks on
//! a single accept, then hands the accepted socket to the core and starts
//! the relay. The listen endpoint is closed as soon as that accept resolves,
//! so later connection attempts are refused.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::bridge::{BridgeCore, ConnectionBridge};
use crate::channel::DuplexChannel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::event::{BridgeId, EventSink};
use crate::listen::{self, ListenHandle};
use crate::relay::RelayStats;

/// Setup progress of an [`OutgoingBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Init,
    Listening,
    Accepted,
    Failed,
    Relaying,
    Closed,
}

pub struct OutgoingBridge<R: DuplexChannel> {
    core: Arc<BridgeCore<R>>,
    listen: Mutex<Option<ListenHandle>>,
    phase: Mutex<BridgePhase>,
}

impl<R: DuplexChannel> OutgoingBridge<R> {
    pub fn new(remote: R, sink: EventSink) -> Arc<Self> {
        Self::with_config(remote, sink, BridgeConfig::default())
    }

    pub fn with_config(remote: R, sink: EventSink, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            core: BridgeCore::new(remote, sink, config),
            listen: Mutex::new(None),
            phase: Mutex::new(BridgePhase::Init),
        })
    }

    /// Run the listen/accept/handoff sequence on a dedicated thread.
    ///
    /// If the thread cannot be spawned the bridge is closed and the error
    /// returned; no event is emitted.
    pub fn start(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let bridge = Arc::clone(self);
        thread::Builder::new()
            .name(self.core.thread_name())
            .spawn(move || bridge.run())
            .map_err(|source| {
                self.close();
                BridgeError::Spawn {
                    what: "outgoing bridge",
                    source,
                }
            })
    }

    /// Port of the listen endpoint while it exists, 0 otherwise.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.lock_listen().as_ref().map_or(0, ListenHandle::port)
    }

    #[must_use]
    pub fn phase(&self) -> BridgePhase {
        let phase = *self.phase.lock().unwrap_or_else(|e| e.into_inner());
        match phase {
            BridgePhase::Failed => BridgePhase::Failed,
            _ if self.core.is_closed() => BridgePhase::Closed,
            phase => phase,
        }
    }

    fn run(&self) {
        let id = self.core.id();
        match self.establish() {
            Ok(()) => self.set_phase(BridgePhase::Relaying),
            Err(error) if error.is_closed() => {
                tracing::info!(bridge = %id, "bridge closed during setup");
            }
            Err(error) => {
                self.set_phase(BridgePhase::Failed);
                self.core.fail(error);
            }
        }
        tracing::info!(bridge = %id, "exiting setup thread");
    }

    fn establish(&self) -> Result<()> {
        let listener = self.open_listener()?;
        self.set_phase(BridgePhase::Listening);

        tracing::debug!(bridge = %self.core.id(), "now accepting connections");
        let accepted = listener.accept();
        self.release_listener();
        drop(listener);

        let socket = self.resolve_accept(accepted)?;
        self.set_phase(BridgePhase::Accepted);
        self.core.attach_local(socket)?;
        self.core.start_relay()
    }

    /// Bind the endpoint, publish it for `close()`, and report the port.
    fn open_listener(&self) -> Result<TcpListener> {
        let (listener, handle) =
            listen::bind(self.core.config().bind_addr).map_err(BridgeError::Bind)?;
        let port = handle.port();
        {
            let mut slot = self.lock_listen();
            // close() flips the core flag before it looks at the slot.
            if self.core.is_closed() {
                return Err(BridgeError::Closed);
            }
            *slot = Some(handle);
        }
        self.core.report_listening(port);
        Ok(listener)
    }

    fn resolve_accept(
        &self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
    ) -> Result<TcpStream> {
        match accepted {
            Ok((socket, peer)) if self.core.is_closed() => {
                tracing::debug!(bridge = %self.core.id(), %peer, "discarding connection accepted during close");
                drop(socket);
                Err(BridgeError::Closed)
            }
            Ok((socket, peer)) => {
                tracing::info!(bridge = %self.core.id(), %peer, "accepted local connection");
                Ok(socket)
            }
            Err(_) if self.core.is_closed() => Err(BridgeError::Closed),
            Err(error) => Err(BridgeError::Accept(error)),
        }
    }

    /// Close the endpoint and wake a pending accept. The slot stays locked
    /// until the endpoint is closed, so concurrent callers return after it.
    fn close_listener(&self) {
        let mut slot = self.lock_listen();
        if let Some(handle) = slot.take() {
            handle.close();
        }
    }

    /// Drop the endpoint after the accept has returned.
    fn release_listener(&self) {
        let handle = self.lock_listen().take();
        if let Some(handle) = handle {
            handle.discard();
        }
    }

    fn set_phase(&self, next: BridgePhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase != BridgePhase::Failed {
            *phase = next;
        }
    }

    fn lock_listen(&self) -> MutexGuard<'_, Option<ListenHandle>> {
        self.listen.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<R: DuplexChannel> ConnectionBridge for OutgoingBridge<R> {
    fn id(&self) -> BridgeId {
        self.core.id()
    }

    fn close(&self) {
        self.core.close();
        self.close_listener();
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn stats(&self) -> RelayStats {
        self.core.stats()
    }

    fn local_peer_addr(&self) -> Option<SocketAddr> {
        self.core.local_peer_addr()
    }
}

impl<R: DuplexChannel> Drop for OutgoingBridge<R> {
    fn drop(&mut self) {
        self.release_listener();
    }
}
