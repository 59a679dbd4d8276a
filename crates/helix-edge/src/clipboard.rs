//! Per-container `Clipboard Slot` (`spec.md` §3, §4.2 item 5): the latest
//! text payload plus a monotonic version counter, mirroring the same
//! poll-and-version-bump clipboard backend shape used elsewhere in this
//! workspace but exposed as plain HTTP GET/POST rather than a virtual
//! channel.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardPayload {
    pub data: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub version: u64,
}

struct Inner {
    data: String,
    mime_type: String,
    version: u64,
}

/// Reads and writes are serialized through a single mutex; no cross-session
/// visibility (`spec.md` §4.2 item 5) — enforced automatically since one
/// `ClipboardSlot` is scoped to exactly one Edge Server process.
pub struct ClipboardSlot {
    inner: Mutex<Inner>,
}

impl Default for ClipboardSlot {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { data: String::new(), mime_type: "text/plain".to_string(), version: 0 }),
        }
    }
}

impl ClipboardSlot {
    #[must_use]
    pub fn read(&self) -> ClipboardPayload {
        let guard = self.inner.lock().expect("clipboard mutex poisoned");
        ClipboardPayload { data: guard.data.clone(), mime_type: guard.mime_type.clone(), version: guard.version }
    }

    /// Writes and increments the version counter. Returns the new version.
    pub fn write(&self, data: String, mime_type: String) -> u64 {
        let mut guard = self.inner.lock().expect("clipboard mutex poisoned");
        guard.data = data;
        guard.mime_type = mime_type;
        guard.version += 1;
        guard.version
    }

    /// Overwrites the slot from a native-clipboard poll without bumping the
    /// version if the content hasn't actually changed, so the version
    /// counter only reflects real writes either direction.
    fn write_if_changed(&self, data: String) {
        let mut guard = self.inner.lock().expect("clipboard mutex poisoned");
        if guard.data != data {
            guard.data = data;
            guard.mime_type = "text/plain".to_string();
            guard.version += 1;
        }
    }
}

/// Background task: polls the native clipboard at `hz` for remote→local
/// synchronization (`spec.md` §4.2 item 5). Local→remote writes (via
/// [`ClipboardSlot::write`]) are pushed through immediately by the caller
/// and never wait on this loop.
pub async fn poll_native_clipboard(slot: std::sync::Arc<ClipboardSlot>, hz: f64) {
    let period = Duration::from_secs_f64(1.0 / hz.max(0.1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let slot = std::sync::Arc::clone(&slot);
        let text = tokio::task::spawn_blocking(move || {
            arboard::Clipboard::new().and_then(|mut cb| cb.get_text())
        })
        .await;
        match text {
            Ok(Ok(text)) => slot.write_if_changed(text),
            Ok(Err(e)) => tracing::trace!(error = %e, "native clipboard read failed"),
            Err(e) => tracing::warn!(error = %e, "clipboard poll task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_increments_version_monotonically() {
        let slot = ClipboardSlot::default();
        assert_eq!(slot.write("a".into(), "text/plain".into()), 1);
        assert_eq!(slot.write("b".into(), "text/plain".into()), 2);
        assert_eq!(slot.write("c".into(), "text/plain".into()), 3);
        assert_eq!(slot.read().version, 3);
        assert_eq!(slot.read().data, "c");
    }

    #[test]
    fn unchanged_native_poll_does_not_bump_version() {
        let slot = ClipboardSlot::default();
        slot.write("same".into(), "text/plain".into());
        let v = slot.read().version;
        slot.write_if_changed("same".to_string());
        assert_eq!(slot.read().version, v);
        slot.write_if_changed("different".to_string());
        assert_eq!(slot.read().version, v + 1);
    }
}
