//! Best-effort persistent event log (SD card on real hardware).
//!
//! The core never blocks on logging: `append` enqueues onto an unbounded
//! channel drained by a writer task. Write failures are logged and dropped.

use std::sync::Arc;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

pub trait EventLog: Send + Sync {
    fn append(&self, line: &str);
}

/// Discards everything. Used when no log path is configured.
pub struct NullLog;

impl EventLog for NullLog {
    fn append(&self, _line: &str) {}
}

/// Appends lines to a file via a background writer task.
pub struct FileLog {
    tx: mpsc::UnboundedSender<String>,
}

impl FileLog {
    pub fn spawn(path: String) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let result = async {
                    let mut file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await?;
                    file.write_all(entry.as_bytes()).await?;
                    file.write_all(b"\n").await
                }
                .await;
                if let Err(e) = result {
                    warn!("event log write failed: {e}");
                }
            }
        });
        Arc::new(Self { tx })
    }
}

impl EventLog for FileLog {
    fn append(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}
