//! Shared bridge lifecycle.
//!
//! [`BridgeCore`] owns the remote channel, the attached local socket and the
//! relay. Every variant composes one and implements [`ConnectionBridge`] on
//! top of it.
//!
//! Teardown is split in two steps. Under the state lock the first caller
//! flips `closed` and takes every resource out; the resources are then
//! released outside the lock, so a relay thread that triggers teardown
//! never waits on a lock held by a thread that is joining it. Later
//! `close()` callers block until that release has finished, unless they run
//! on one of the relay threads being joined.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use serde_json::json;

use crate::channel::DuplexChannel;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, RelayDirection, Result};
use crate::event::{BridgeEvent, BridgeId, EventSink};
use crate::relay::{ExitHook, RelayCounters, RelayExit, RelayPair, RelayStats, RelayStreams};
use crate::telemetry::TelemetryLog;

/// Close-and-relay contract shared by every bridge variant.
pub trait ConnectionBridge: Send + Sync {
    fn id(&self) -> BridgeId;

    /// Tear the bridge down. Idempotent, never fails, callable from any
    /// thread including the bridge's own.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Bytes relayed so far.
    fn stats(&self) -> RelayStats;

    /// Peer address of the attached local socket, `None` when detached.
    fn local_peer_addr(&self) -> Option<SocketAddr>;
}

struct LocalAttachment {
    socket: TcpStream,
    reader: Option<TcpStream>,
    writer: Option<TcpStream>,
}

impl LocalAttachment {
    fn close(self) {
        if let Err(error) = self.socket.shutdown(Shutdown::Both) {
            tracing::debug!(%error, "local socket shutdown");
        }
    }
}

struct CoreState<R> {
    closed: bool,
    released: bool,
    relay_threads: Vec<ThreadId>,
    remote: Option<R>,
    local: Option<LocalAttachment>,
    relay: Option<RelayPair>,
}

struct Teardown<R> {
    remote: Option<R>,
    local: Option<LocalAttachment>,
    relay: Option<RelayPair>,
}

pub(crate) struct BridgeCore<R: DuplexChannel> {
    id: BridgeId,
    config: BridgeConfig,
    sink: EventSink,
    state: Mutex<CoreState<R>>,
    released: Condvar,
    closed: AtomicBool,
    listening_reported: AtomicBool,
    counters: Arc<RelayCounters>,
    telemetry: Mutex<TelemetryLog>,
}

impl<R: DuplexChannel> BridgeCore<R> {
    pub(crate) fn new(remote: R, sink: EventSink, config: BridgeConfig) -> Arc<Self> {
        let id = BridgeId::next();
        tracing::info!(bridge = %id, remote = %remote.describe(), "bridge constructed");
        let telemetry = TelemetryLog::open(config.telemetry_path.as_deref(), id);
        Arc::new(Self {
            id,
            config,
            sink,
            state: Mutex::new(CoreState {
                closed: false,
                released: false,
                relay_threads: Vec::new(),
                remote: Some(remote),
                local: None,
                relay: None,
            }),
            released: Condvar::new(),
            closed: AtomicBool::new(false),
            listening_reported: AtomicBool::new(false),
            counters: Arc::new(RelayCounters::default()),
            telemetry: Mutex::new(telemetry),
        })
    }

    pub(crate) fn id(&self) -> BridgeId {
        self.id
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    pub(crate) fn local_peer_addr(&self) -> Option<SocketAddr> {
        let state = self.lock_state();
        state
            .local
            .as_ref()
            .and_then(|local| local.socket.peer_addr().ok())
    }

    pub(crate) fn thread_name(&self) -> String {
        format!("{}-{}", self.config.thread_name, self.id.get())
    }

    /// Publish the listening port. Only the first report per bridge goes out.
    pub(crate) fn report_listening(&self, port: u16) {
        if self.listening_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(bridge = %self.id, port, "listening for a local connection");
        self.record("bridge_listening", json!({ "port": port }));
        self.sink.emit(BridgeEvent::Listening {
            bridge: self.id,
            port,
        });
    }

    /// Install `socket` as the local side, closing any previous one first.
    ///
    /// The socket is closed and `Closed` returned if teardown already began.
    pub(crate) fn attach_local(&self, socket: TcpStream) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            if let Err(error) = socket.shutdown(Shutdown::Both) {
                tracing::debug!(bridge = %self.id, %error, "late local socket shutdown");
            }
            return Err(BridgeError::Closed);
        }

        if let Some(previous) = state.local.take() {
            tracing::info!(bridge = %self.id, "replacing attached local socket");
            previous.close();
        }

        let streams = socket
            .set_nodelay(self.config.nodelay)
            .and_then(|()| Ok((socket.try_clone()?, socket.try_clone()?)));
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(error) => {
                if let Err(shutdown) = socket.shutdown(Shutdown::Both) {
                    tracing::debug!(bridge = %self.id, error = %shutdown, "local socket shutdown");
                }
                return Err(BridgeError::StreamAcquisition(error));
            }
        };

        if let Ok(peer) = socket.peer_addr() {
            tracing::info!(bridge = %self.id, %peer, "local socket attached");
        }
        let attachment = LocalAttachment {
            socket,
            reader: Some(reader),
            writer: Some(writer),
        };
        state.local = Some(attachment);
        Ok(())
    }

    /// Start relaying between the remote channel and the attached local
    /// socket.
    pub(crate) fn start_relay(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(BridgeError::Closed);
        }
        if state.relay.is_some() {
            tracing::debug!(bridge = %self.id, "relay already running");
            return Ok(());
        }

        let (local_in, local_out) = match state.local.as_mut() {
            Some(local) => match (local.reader.take(), local.writer.take()) {
                (Some(reader), Some(writer)) => (reader, writer),
                _ => {
                    return Err(BridgeError::StreamAcquisition(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "local streams already handed to a relay",
                    )));
                }
            },
            None => {
                return Err(BridgeError::StreamAcquisition(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no local socket attached",
                )));
            }
        };
        let Some(remote) = state.remote.as_ref() else {
            return Err(BridgeError::Closed);
        };
        let remote_in = remote.reader().map_err(BridgeError::StreamAcquisition)?;
        let remote_out = remote.writer().map_err(BridgeError::StreamAcquisition)?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let on_exit: ExitHook = Arc::new(move |direction, exit| {
            if let Some(core) = weak.upgrade() {
                core.relay_exited(direction, exit);
            }
        });

        let relay = RelayPair::start(
            RelayStreams {
                remote_in,
                remote_out,
                local_in: Box::new(local_in),
                local_out: Box::new(local_out),
            },
            self.config.buffer_bytes(),
            &self.thread_name(),
            Arc::clone(&self.counters),
            on_exit,
        )
        .map_err(|source| BridgeError::Spawn {
            what: "relay",
            source,
        })?;
        state.relay_threads = relay.thread_ids();
        state.relay = Some(relay);
        drop(state);

        tracing::info!(bridge = %self.id, "relay started");
        self.record("bridge_relay_started", json!({}));
        self.sink.emit(BridgeEvent::RelayStarted { bridge: self.id });
        Ok(())
    }

    /// Externally requested teardown. Emits no event.
    ///
    /// Returns once the bridge's resources are released, whichever caller
    /// performed the release.
    pub(crate) fn close(&self) {
        match self.begin_close() {
            Some(teardown) => {
                tracing::info!(bridge = %self.id, "closing bridge");
                self.release(teardown);
            }
            None => self.wait_released(),
        }
    }

    /// Tear down after a fatal error and report it, unless teardown already
    /// happened.
    pub(crate) fn fail(&self, error: BridgeError) {
        if error.is_closed() {
            tracing::debug!(bridge = %self.id, "operation raced with close");
            return;
        }
        let Some(teardown) = self.begin_close() else {
            tracing::debug!(bridge = %self.id, %error, "failure after close suppressed");
            return;
        };
        let reason = error.to_string();
        tracing::warn!(bridge = %self.id, %reason, "bridge disconnected");
        self.release(teardown);
        self.record("bridge_disconnected", json!({ "reason": reason }));
        self.sink.emit(BridgeEvent::Disconnected {
            bridge: self.id,
            reason,
        });
    }

    fn relay_exited(&self, direction: RelayDirection, exit: RelayExit) {
        let error = match exit {
            RelayExit::Eof => BridgeError::PeerClosed { direction },
            RelayExit::Failed(source) => BridgeError::Relay { direction, source },
        };
        self.fail(error);
    }

    fn begin_close(&self) -> Option<Teardown<R>> {
        let mut state = self.lock_state();
        if state.closed {
            return None;
        }
        state.closed = true;
        self.closed.store(true, Ordering::Release);
        Some(Teardown {
            remote: state.remote.take(),
            local: state.local.take(),
            relay: state.relay.take(),
        })
    }

    fn release(&self, teardown: Teardown<R>) {
        let Teardown {
            remote,
            local,
            relay,
        } = teardown;

        if let Some(relay) = relay.as_ref() {
            relay.signal_stop();
        }
        if let Some(local) = local {
            local.close();
        }
        if let Some(remote) = remote.as_ref() {
            if let Err(error) = remote.shutdown() {
                tracing::debug!(bridge = %self.id, %error, "remote channel shutdown");
            }
        }
        if let Some(relay) = relay {
            relay.stop();
        }
        drop(remote);

        self.lock_state().released = true;
        self.released.notify_all();

        let stats = self.counters.snapshot();
        tracing::info!(
            bridge = %self.id,
            remote_to_local_bytes = stats.remote_to_local_bytes,
            local_to_remote_bytes = stats.local_to_remote_bytes,
            "bridge closed"
        );
        self.record(
            "bridge_closed",
            json!({
                "remote_to_local_bytes": stats.remote_to_local_bytes,
                "local_to_remote_bytes": stats.local_to_remote_bytes,
            }),
        );
    }

    /// Block until the winning teardown has released everything. A relay
    /// thread returns at once: the releasing thread may be joining it.
    fn wait_released(&self) {
        let current = thread::current().id();
        let mut state = self.lock_state();
        if state.relay_threads.contains(&current) {
            return;
        }
        while !state.released {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn record(&self, event: &str, payload: serde_json::Value) {
        self.telemetry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(event, payload);
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState<R>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<R: DuplexChannel> Drop for BridgeCore<R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    fn new_core() -> (
        Arc<BridgeCore<TcpStream>>,
        TcpStream,
        std::sync::mpsc::Receiver<BridgeEvent>,
    ) {
        let (remote, remote_peer) = tcp_pair();
        let (sink, rx) = event_channel();
        let core = BridgeCore::new(remote, sink, BridgeConfig::default().without_telemetry());
        (core, remote_peer, rx)
    }

    #[test]
    fn relay_moves_bytes_after_attach() {
        let (core, mut remote_peer, rx) = new_core();
        let (local, mut local_peer) = tcp_pair();
        core.attach_local(local).expect("attach");
        core.start_relay().expect("relay");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).expect("event"),
            BridgeEvent::RelayStarted { bridge: core.id() }
        );

        local_peer.write_all(b"ping").expect("write");
        let mut buf = [0_u8; 4];
        remote_peer.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ping");

        core.close();
        assert!(core.is_closed());
        assert!(core.local_peer_addr().is_none());
        assert!(rx.try_recv().is_err(), "clean close emits nothing");
    }

    #[test]
    fn attach_replaces_previous_socket() {
        let (core, _remote_peer, _rx) = new_core();
        let (first, mut first_peer) = tcp_pair();
        let (second, _second_peer) = tcp_pair();
        let second_addr = second.peer_addr().expect("addr");

        core.attach_local(first).expect("attach first");
        core.attach_local(second).expect("attach second");
        assert_eq!(core.local_peer_addr(), Some(second_addr));

        first_peer
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0_u8; 1];
        assert!(matches!(first_peer.read(&mut buf), Ok(0) | Err(_)));
        core.close();
    }

    #[test]
    fn attach_after_close_is_refused_and_closes_socket() {
        let (core, _remote_peer, _rx) = new_core();
        core.close();
        let (local, mut local_peer) = tcp_pair();
        let error = core.attach_local(local).expect_err("closed bridge refuses");
        assert!(error.is_closed());

        local_peer
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0_u8; 1];
        assert!(matches!(local_peer.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn start_relay_without_local_socket_fails() {
        let (core, _remote_peer, _rx) = new_core();
        let error = core.start_relay().expect_err("no local socket");
        assert!(matches!(error, BridgeError::StreamAcquisition(_)));
        core.close();
    }

    #[test]
    fn fail_reports_once_then_suppresses() {
        let (core, _remote_peer, rx) = new_core();
        core.fail(BridgeError::Accept(std::io::Error::other("boom")));
        core.fail(BridgeError::Accept(std::io::Error::other("again")));
        core.close();

        match rx.try_recv().expect("one event") {
            BridgeEvent::Disconnected { reason, .. } => assert!(reason.contains("boom")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fail_after_close_is_silent() {
        let (core, _remote_peer, rx) = new_core();
        core.close();
        core.fail(BridgeError::Accept(std::io::Error::other("late")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_shuts_remote_channel() {
        let (core, mut remote_peer, _rx) = new_core();
        core.close();
        core.close();
        remote_peer
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut buf = [0_u8; 1];
        assert!(matches!(remote_peer.read(&mut buf), Ok(0) | Err(_)));
    }

    /// Remote channel whose shutdown takes a while to complete.
    struct SlowShutdown {
        inner: TcpStream,
        completed: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl DuplexChannel for SlowShutdown {
        fn reader(&self) -> std::io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(self.inner.try_clone()?))
        }

        fn writer(&self) -> std::io::Result<Box<dyn Write + Send>> {
            Ok(Box::new(self.inner.try_clone()?))
        }

        fn shutdown(&self) -> std::io::Result<()> {
            thread::sleep(Duration::from_millis(300));
            let result = self.inner.shutdown(Shutdown::Both);
            self.completed.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    #[test]
    fn second_close_waits_for_teardown_in_progress() {
        let (inner, _peer) = tcp_pair();
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let remote = SlowShutdown {
            inner,
            completed: Arc::clone(&completed),
        };
        let (sink, rx) = event_channel();
        let core = BridgeCore::new(remote, sink, BridgeConfig::default().without_telemetry());

        let first = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.close())
        };
        thread::sleep(Duration::from_millis(50));
        core.close();
        assert_eq!(
            completed.load(Ordering::SeqCst),
            1,
            "close() returned while teardown was still running"
        );

        first.join().expect("first close");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn relay_triggered_teardown_is_released_before_later_close() {
        let (core, remote_peer, rx) = new_core();
        let (local, _local_peer) = tcp_pair();
        core.attach_local(local).expect("attach");
        core.start_relay().expect("relay");
        let relay_threads = core.lock_state().relay_threads.clone();
        assert_eq!(relay_threads.len(), 2);

        // The remote hang-up makes a relay thread run the whole teardown.
        drop(remote_peer);
        match rx.recv_timeout(Duration::from_secs(2)).expect("relay started") {
            BridgeEvent::RelayStarted { .. } => {}
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv_timeout(Duration::from_secs(2)).expect("disconnect") {
            BridgeEvent::Disconnected { reason, .. } => assert!(reason.contains("remote channel")),
            other => panic!("unexpected event {other:?}"),
        }
        core.close();
        assert!(core.lock_state().released);
    }

    #[test]
    fn listening_reported_at_most_once() {
        let (core, _remote_peer, rx) = new_core();
        core.report_listening(1234);
        core.report_listening(1234);
        assert_eq!(
            rx.try_recv().expect("event"),
            BridgeEvent::Listening {
                bridge: core.id(),
                port: 1234
            }
        );
        assert!(rx.try_recv().is_err());
        core.close();
    }
}
