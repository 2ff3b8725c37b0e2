use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Environment variable that enables JSONL telemetry by default.
pub const TELEMETRY_ENV: &str = "SOCKBRIDGE_TELEMETRY";

/// Construction-time settings shared by every bridge variant.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the local endpoint binds (outgoing) or connects to
    /// (incoming). Port 0 means OS-assigned.
    pub bind_addr: SocketAddr,
    /// Read buffer size of each relay direction.
    pub relay_buffer_bytes: usize,
    /// Set `TCP_NODELAY` on the local socket.
    pub nodelay: bool,
    /// Optional JSONL telemetry file path.
    pub telemetry_path: Option<PathBuf>,
    /// Prefix for the names of threads spawned by a bridge.
    pub thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let telemetry_path = std::env::var_os(TELEMETRY_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            relay_buffer_bytes: 8192,
            nodelay: true,
            telemetry_path,
            thread_name: "sockbridge".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_relay_buffer(mut self, bytes: usize) -> Self {
        self.relay_buffer_bytes = bytes;
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    pub fn with_telemetry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.telemetry_path = Some(path.into());
        self
    }

    pub fn without_telemetry(mut self) -> Self {
        self.telemetry_path = None;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Relay buffer size, never zero.
    #[must_use]
    pub(crate) fn buffer_bytes(&self) -> usize {
        self.relay_buffer_bytes.max(1)
    }
}
