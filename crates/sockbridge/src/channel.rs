//! Remote channel abstraction.
//!
//! The bridge never connects or reconnects the remote side; it only needs
//! independent read and write halves and a way to force pending reads to
//! return. Platform transports (RFCOMM, vsock, ...) implement
//! [`DuplexChannel`] outside this crate.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A pre-connected duplex byte stream owned by a bridge.
pub trait DuplexChannel: Send + Sync + 'static {
    /// Independent read half.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Independent write half.
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Shut the channel down in both directions.
    ///
    /// Must be callable from any thread and must make blocked reads on
    /// halves returned by [`reader`](Self::reader) return.
    fn shutdown(&self) -> io::Result<()>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "remote channel".to_string()
    }
}

impl DuplexChannel for TcpStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("tcp {addr}"),
            Err(_) => "tcp (disconnected)".to_string(),
        }
    }
}

#[cfg(unix)]
impl DuplexChannel for std::os::unix::net::UnixStream {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn describe(&self) -> String {
        "unix stream".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn tcp_halves_are_independent() {
        let (channel, mut peer) = tcp_pair();
        let mut writer = channel.writer().expect("writer");
        let mut reader = channel.reader().expect("reader");

        writer.write_all(b"abc").expect("write");
        let mut buf = [0_u8; 3];
        peer.read_exact(&mut buf).expect("peer read");
        assert_eq!(&buf, b"abc");

        peer.write_all(b"xyz").expect("peer write");
        reader.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn tcp_shutdown_unblocks_reader() {
        let (channel, _peer) = tcp_pair();
        let mut reader = channel.reader().expect("reader");
        let handle = std::thread::spawn(move || {
            let mut buf = [0_u8; 8];
            reader.read(&mut buf)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        DuplexChannel::shutdown(&channel).expect("shutdown");
        let result = handle.join().expect("join reader");
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[test]
    fn tcp_describe_mentions_peer() {
        let (channel, peer) = tcp_pair();
        let expected = peer.local_addr().expect("addr").to_string();
        assert!(channel.describe().contains(&expected));
    }

    #[cfg(unix)]
    #[test]
    fn unix_stream_round_trip() {
        let (a, mut b) = std::os::unix::net::UnixStream::pair().expect("pair");
        a.writer().expect("writer").write_all(b"hi").expect("write");
        let mut buf = [0_u8; 2];
        b.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hi");
    }
}
