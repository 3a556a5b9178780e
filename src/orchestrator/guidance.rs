//! Polls `.autonoma/guidance.txt` for an external operator's inbound
//! message and consumes it atomically (read then unlink), per the 5 s
//! rendezvous contract external tooling can rely on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub fn guidance_path(working_dir: &Path) -> PathBuf {
    working_dir.join(".autonoma").join("guidance.txt")
}

/// Reads and removes the rendezvous file if present. A read that fails
/// (not there yet, or a half-written rename in flight) is treated as
/// "nothing to consume" rather than an error — the next poll tries again.
pub fn consume(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let _ = std::fs::remove_file(path);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Spawns a background task that polls every [`POLL_INTERVAL`] and forwards
/// each non-empty message it consumes to the returned receiver. The caller
/// owns the join handle and should abort it once the orchestration cycle
/// that started it ends.
pub fn spawn_watcher(working_dir: PathBuf) -> (UnboundedReceiver<String>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let path = guidance_path(&working_dir);
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        // The default first tick fires immediately; skip it so the very
        // first check happens a full interval after the cycle starts.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Some(guidance) = consume(&path) {
                if tx.send(guidance).is_err() {
                    return;
                }
            }
        }
    });
    (rx, handle)
}
