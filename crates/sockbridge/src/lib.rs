//! Relay a pre-connected remote channel through a loopback TCP socket.
//!
//! A remote link (an RFCOMM session, a vsock stream, any [`DuplexChannel`])
//! is paired with a local TCP connection so that a local application can
//! talk to the remote peer with ordinary socket calls.
//!
//! - [`OutgoingBridge`] opens an ephemeral loopback port, reports it through
//!   the [`EventSink`], accepts exactly one client and relays.
//! - [`IncomingBridge`] connects to an already listening local server.
//!
//! Both implement [`ConnectionBridge`]: `close()` is idempotent, safe from
//! any thread, and races cleanly with a pending accept or a failing relay.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use sockbridge::{BridgeEvent, ConnectionBridge, OutgoingBridge, event_channel};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = TcpStream::connect("192.0.2.10:7000")?;
//! let (sink, events) = event_channel();
//! let bridge = OutgoingBridge::new(remote, sink);
//! bridge.start()?;
//!
//! if let BridgeEvent::Listening { port, .. } = events.recv()? {
//!     println!("local clients connect to 127.0.0.1:{port}");
//! }
//! bridge.close();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod bridge;
mod channel;
mod config;
mod error;
mod event;
mod incoming;
mod listen;
mod outgoing;
mod relay;
mod telemetry;

pub use bridge::ConnectionBridge;
pub use channel::DuplexChannel;
pub use config::{BridgeConfig, TELEMETRY_ENV};
pub use error::{BridgeError, RelayDirection, Result};
pub use event::{BridgeEvent, BridgeId, EventSink, event_channel};
pub use incoming::IncomingBridge;
pub use outgoing::{BridgePhase, OutgoingBridge};
pub use relay::RelayStats;
