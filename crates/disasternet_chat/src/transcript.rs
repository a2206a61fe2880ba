//! Plain-text transcript of a room's messages.
//!
//! Each message becomes one `[timestamp] sender: message` line. Writes go
//! through a background task so observers never block on disk I/O.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::message::ChatMessage;
use crate::observer::ObserverId;
use crate::room::ChatRoom;

/// Appends transcript lines to a file from a background task.
#[derive(Clone)]
pub struct TranscriptWriter {
    path: PathBuf,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TranscriptWriter {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        ensure_parent(&path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(path.clone(), rx));
        debug!("Transcript writer started at {}", path.display());

        Ok(Self {
            path,
            tx: Arc::new(Mutex::new(Some(tx))),
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `msg` for writing. Ignored once closed.
    pub fn record(&self, msg: &ChatMessage) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(msg.log_line());
        }
    }

    /// Record every message `room` appends from now on.
    pub fn attach(&self, room: &ChatRoom) -> ObserverId {
        let writer = self.clone();
        room.on_message(move |msg| writer.record(msg))
    }

    /// Stop accepting lines and wait for queued ones to be written.
    pub async fn close(&self) {
        self.tx.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = append_line(&path, &line).await {
            error!("Failed to write transcript {}: {e}", path.display());
        }
    }
}

async fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(format!("{line}\n").as_bytes()).await?;
    file.flush().await
}

/// Non-empty lines of the transcript at `path`. A missing file reads as empty.
pub fn read_entries(path: &Path) -> io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Truncate the transcript at `path`, creating it if needed.
pub fn clear(path: &Path) -> io::Result<()> {
    ensure_parent(path)?;
    std::fs::write(path, "")
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use disasternet_network::router::RouterConfig;
    use disasternet_network::{GossipRouter, NodeIdentity};

    #[tokio::test]
    async fn test_attach_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("messages.txt");

        let router = GossipRouter::new(*NodeIdentity::generate().peer_id(), RouterConfig::default());
        let room = ChatRoom::new(router, "alpha", "Alice");
        room.subscribe();

        let writer = TranscriptWriter::spawn(&path).unwrap();
        writer.attach(&room);
        let first = room.send_message("bridge is out").unwrap();
        room.send_message("use the east road").unwrap();
        writer.close().await;

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first.log_line());
        assert!(entries[0].ends_with("] Alice: bridge is out"));
        assert!(entries[1].ends_with("] Alice: use the east road"));
    }

    #[tokio::test]
    async fn test_record_after_close_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.txt");
        let writer = TranscriptWriter::spawn(&path).unwrap();
        writer.close().await;

        writer.record(&ChatMessage::new("Bob", "bbbbbbbb", "late", 1));
        writer.close().await;
        assert!(read_entries(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read_missing_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.txt");
        assert!(read_entries(&path).unwrap().is_empty());

        std::fs::write(&path, "[t] a: one\n\n   \n[t] b: two\n").unwrap();
        assert_eq!(read_entries(&path).unwrap(), vec!["[t] a: one", "[t] b: two"]);

        clear(&path).unwrap();
        assert!(read_entries(&path).unwrap().is_empty());
        assert!(path.exists());
    }
}
