//! Ephemeral local listen endpoint.
//!
//! The accept thread blocks on its own [`TcpListener`]; the bridge keeps a
//! [`ListenHandle`] to the same socket so `close()` can force that accept to
//! return. On Unix the listening socket is shut down, which fails a pending
//! accept immediately. Where that is unsupported a throwaway loopback
//! connection wakes the accept instead; the accept thread sees the bridge
//! closed and drops what it got.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

const WAKE_TIMEOUT: Duration = Duration::from_millis(250);

/// Bind `addr` and return the accepting listener plus a handle that can
/// close it from another thread.
pub(crate) fn bind(addr: SocketAddr) -> io::Result<(TcpListener, ListenHandle)> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    let handle = ListenHandle {
        listener: listener.try_clone()?,
        local_addr,
    };
    Ok((listener, handle))
}

#[derive(Debug)]
pub(crate) struct ListenHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListenHandle {
    pub(crate) fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Release the handle once the accept has already returned. Nothing is
    /// blocked on the endpoint, so no wake-up is needed.
    pub(crate) fn discard(self) {
        tracing::debug!(addr = %self.local_addr, "listen handle released after accept");
    }

    /// Close the endpoint and unblock any accept pending on it.
    pub(crate) fn close(self) {
        if let Err(error) = shutdown_listener(&self.listener) {
            tracing::debug!(%error, addr = %self.local_addr, "listener shutdown unsupported; waking accept");
            let target = wake_target(self.local_addr);
            if let Err(error) = TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
                tracing::debug!(%error, %target, "accept wake-up connection failed");
            }
        }
    }
}

#[cfg(unix)]
fn shutdown_listener(listener: &TcpListener) -> io::Result<()> {
    rustix::net::shutdown(listener, rustix::net::Shutdown::Read).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn shutdown_listener(_listener: &TcpListener) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "listener shutdown not available on this platform",
    ))
}

fn wake_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
