//! Full-duplex byte relay.
//!
//! [`RelayPair`] runs one blocking copy loop per direction on its own named
//! thread. It never closes the streams it was given: the owner shuts the
//! underlying sockets down, which makes the loops' reads return, and then
//! calls [`RelayPair::stop`] to join them.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::error::RelayDirection;

/// Why a copy loop ended.
#[derive(Debug)]
pub(crate) enum RelayExit {
    /// The source side reached end of stream.
    Eof,
    /// Reading the source or writing the sink failed.
    Failed(io::Error),
}

/// Called once per direction when its loop ends without a stop request.
pub(crate) type ExitHook = Arc<dyn Fn(RelayDirection, RelayExit) + Send + Sync>;

/// The four halves a relay copies between.
pub(crate) struct RelayStreams {
    pub(crate) remote_in: Box<dyn Read + Send>,
    pub(crate) remote_out: Box<dyn Write + Send>,
    pub(crate) local_in: Box<dyn Read + Send>,
    pub(crate) local_out: Box<dyn Write + Send>,
}

/// Bytes taken from each source, shared with the copy loops.
#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    remote_to_local: AtomicU64,
    local_to_remote: AtomicU64,
}

impl RelayCounters {
    fn counter(&self, direction: RelayDirection) -> &AtomicU64 {
        match direction {
            RelayDirection::RemoteToLocal => &self.remote_to_local,
            RelayDirection::LocalToRemote => &self.local_to_remote,
        }
    }

    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            remote_to_local_bytes: self.remote_to_local.load(Ordering::Relaxed),
            local_to_remote_bytes: self.local_to_remote.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub remote_to_local_bytes: u64,
    pub local_to_remote_bytes: u64,
}

pub(crate) struct RelayPair {
    stopping: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RelayPair {
    /// Spawn both copy loops.
    ///
    /// If the second thread cannot be spawned the first is told to stop and
    /// left to exit once its streams are shut down.
    pub(crate) fn start(
        streams: RelayStreams,
        buffer_bytes: usize,
        thread_name: &str,
        counters: Arc<RelayCounters>,
        on_exit: ExitHook,
    ) -> io::Result<Self> {
        let stopping = Arc::new(AtomicBool::new(false));
        let RelayStreams {
            remote_in,
            remote_out,
            local_in,
            local_out,
        } = streams;

        let mut threads = Vec::with_capacity(2);
        for (direction, reader, writer) in [
            (RelayDirection::RemoteToLocal, remote_in, local_out),
            (RelayDirection::LocalToRemote, local_in, remote_out),
        ] {
            let stopping_flag = Arc::clone(&stopping);
            let counters = Arc::clone(&counters);
            let on_exit = Arc::clone(&on_exit);
            let spawned = thread::Builder::new()
                .name(format!("{thread_name}-{}", direction.label()))
                .spawn(move || {
                    let exit = pump(reader, writer, buffer_bytes, counters.counter(direction));
                    if stopping_flag.load(Ordering::Acquire) {
                        tracing::debug!(%direction, ?exit, "relay direction stopped");
                    } else {
                        on_exit(direction, exit);
                    }
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(error) => {
                    stopping.store(true, Ordering::Release);
                    return Err(error);
                }
            }
        }

        Ok(Self { stopping, threads })
    }

    /// Mark the relay as stopping so loop exits are not reported.
    pub(crate) fn signal_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Ids of the copy-loop threads, for callers that must not block on
    /// their own relay.
    pub(crate) fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|handle| handle.thread().id()).collect()
    }

    /// Signal stop and join both loops.
    ///
    /// A loop that calls `stop` from inside its own exit hook is not joined;
    /// it finishes as soon as the hook returns.
    pub(crate) fn stop(self) {
        self.signal_stop();
        let current = thread::current().id();
        for handle in self.threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("relay thread panicked");
            }
        }
    }
}

fn pump(
    mut reader: Box<dyn Read + Send>,
    mut writer: Box<dyn Write + Send>,
    buffer_bytes: usize,
    counter: &AtomicU64,
) -> RelayExit {
    let mut buffer = vec![0_u8; buffer_bytes.max(1)];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return RelayExit::Eof,
            Ok(n) => {
                counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
                if let Err(error) = writer.write_all(&buffer[..n]).and_then(|()| writer.flush()) {
                    return RelayExit::Failed(error);
                }
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return RelayExit::Failed(error),
        }
    }
}
