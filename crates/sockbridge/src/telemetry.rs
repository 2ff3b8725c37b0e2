//! Optional JSONL lifecycle log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::event::BridgeId;

pub(crate) struct TelemetryLog {
    file: Option<File>,
    bridge: BridgeId,
    seq: u64,
}

impl TelemetryLog {
    /// Open the log. A file that cannot be opened disables telemetry for
    /// this bridge instead of failing it.
    pub(crate) fn open(path: Option<&Path>, bridge: BridgeId) -> Self {
        let file = path.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(file),
                Err(error) => {
                    tracing::warn!(%bridge, path = %path.display(), %error, "telemetry disabled");
                    None
                }
            }
        });
        Self {
            file,
            bridge,
            seq: 0,
        }
    }

    pub(crate) fn record(&mut self, event: &str, payload: Value) {
        if let Err(error) = self.write(event, payload) {
            tracing::warn!(bridge = %self.bridge, %error, "telemetry write failed; disabling");
            self.file = None;
        }
    }

    fn write(&mut self, event: &str, payload: Value) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let line = json!({
            "event": event,
            "ts": now_iso8601(),
            "bridge": self.bridge.to_string(),
            "seq": self.seq,
            "payload": payload,
        });
        self.seq = self.seq.saturating_add(1);
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

fn now_iso8601() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
