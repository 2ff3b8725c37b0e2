//! Bridge that dials an existing local server.
//!
//! Used when the remote peer initiated the channel: the local application
//! already listens on a known port, so the bridge connects to it instead of
//! opening an endpoint of its own.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::bridge::{BridgeCore, ConnectionBridge};
use crate::channel::DuplexChannel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::event::{BridgeId, EventSink};
use crate::relay::RelayStats;

pub struct IncomingBridge<R: DuplexChannel> {
    core: Arc<BridgeCore<R>>,
    port: u16,
}

impl<R: DuplexChannel> IncomingBridge<R> {
    pub fn new(remote: R, port: u16, sink: EventSink) -> Arc<Self> {
        Self::with_config(remote, port, sink, BridgeConfig::default())
    }

    /// The local server address is `config.bind_addr`'s IP with `port`.
    pub fn with_config(remote: R, port: u16, sink: EventSink, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            core: BridgeCore::new(remote, sink, config),
            port,
        })
    }

    #[must_use]
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.core.config().bind_addr.ip(), self.port)
    }

    pub fn start(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let bridge = Arc::clone(self);
        thread::Builder::new()
            .name(self.core.thread_name())
            .spawn(move || bridge.run())
            .map_err(|source| {
                self.close();
                BridgeError::Spawn {
                    what: "incoming bridge",
                    source,
                }
            })
    }

    fn run(&self) {
        if let Err(error) = self.establish() {
            self.core.fail(error);
        }
        tracing::info!(bridge = %self.core.id(), "exiting setup thread");
    }

    fn establish(&self) -> Result<()> {
        if self.core.is_closed() {
            return Err(BridgeError::Closed);
        }
        let target = self.target();
        tracing::info!(bridge = %self.core.id(), %target, "connecting to local server");
        let socket = TcpStream::connect(target).map_err(|source| BridgeError::Connect {
            port: self.port,
            source,
        })?;
        self.core.attach_local(socket)?;
        self.core.start_relay()
    }
}

impl<R: DuplexChannel> ConnectionBridge for IncomingBridge<R> {
    fn id(&self) -> BridgeId {
        self.core.id()
    }

    fn close(&self) {
        self.core.close();
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
