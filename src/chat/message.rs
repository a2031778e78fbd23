// Chat messages and the in-process message log

use crate::chat::client::ClientId;
use crate::chat::error::RelayResult;
use bytes::Bytes;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// A message received from one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Connection identity of the sender
    pub sender: ClientId,
    /// Raw payload, exactly as one read returned it
    pub content: Bytes,
    /// When the relay received the payload
    pub received_at: SystemTime,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(sender: ClientId, content: Bytes) -> Self {
        Self {
            sender,
            content,
            received_at: SystemTime::now(),
        }
    }

    /// Content as text, replacing invalid UTF-8
    pub fn content_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    /// Time since the message was received
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.received_at)
            .unwrap_or(Duration::from_secs(0))
    }
}

/// A message together with its position in the log
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    /// Append sequence number, starting at 0
    pub seq: u64,
    pub message: Message,
}

/// One line of the JSON archive written when the log is drained
///
/// UTF-8 payloads are stored as `content`; anything else is stored
/// byte-exact as `content_hex`.
#[derive(Debug, Serialize)]
struct ArchiveRecord<'a> {
    seq: u64,
    sender: ClientId,
    received_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_hex: Option<String>,
}

impl<'a> From<&'a LoggedMessage> for ArchiveRecord<'a> {
    fn from(entry: &'a LoggedMessage) -> Self {
        let received_at_ms = entry
            .message
            .received_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let (content, content_hex) = match std::str::from_utf8(&entry.message.content) {
            Ok(text) => (Some(text), None),
            Err(_) => (None, Some(hex::encode(&entry.message.content))),
        };

        Self {
            seq: entry.seq,
            sender: entry.message.sender,
            received_at_ms,
            content,
            content_hex,
        }
    }
}

/// Retention limits for the message log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRetention {
    /// Oldest entries are dropped once this many are held
    pub max_entries: usize,
    /// Entries older than this are pruned, if set
    pub max_age: Option<Duration>,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_age: None,
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<LoggedMessage>,
    next_seq: u64,
    dropped: u64,
}

/// Append-only, ordered record of every message the relay received
pub struct MessageLog {
    state: Arc<RwLock<LogState>>,
    retention: LogRetention,
}

impl MessageLog {
    /// Create an empty log with the given retention
    pub fn new(retention: LogRetention) -> Self {
        Self {
            state: Arc::new(RwLock::new(LogState::default())),
            retention,
        }
    }

    pub fn retention(&self) -> LogRetention {
        self.retention
    }

    /// Append a message, returning its sequence number
    pub async fn append(&self, message: Message) -> u64 {
        let mut state = self.state.write().await;

        let seq = state.next_seq;
        state.next_seq += 1;

        // Enforce max size (FIFO)
        while state.entries.len() >= self.retention.max_entries.max(1) {
            state.entries.pop_front();
            state.dropped += 1;
        }

        state.entries.push_back(LoggedMessage { seq, message });
        seq
    }

    /// Snapshot of the retained entries, oldest first
    pub async fn entries(&self) -> Vec<LoggedMessage> {
        let state = self.state.read().await;
        state.entries.iter().cloned().collect()
    }

    /// Number of retained entries
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Number of messages ever appended
    pub async fn total_appended(&self) -> u64 {
        self.state.read().await.next_seq
    }

    /// Number of entries dropped by retention (size cap, age, or drain)
    pub async fn dropped(&self) -> u64 {
        self.state.read().await.dropped
    }

    /// Remove entries older than `max_age`, returning how many were pruned
    pub async fn prune_expired(&self) -> usize {
        let Some(max_age) = self.retention.max_age else {
            return 0;
        };

        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.message.age() < max_age);
        let pruned = before - state.entries.len();
        state.dropped += pruned as u64;
        pruned
    }

    /// Take every retained entry out of the log
    pub async fn drain(&self) -> Vec<LoggedMessage> {
        let mut state = self.state.write().await;
        let drained: Vec<_> = state.entries.drain(..).collect();
        state.dropped += drained.len() as u64;
        drained
    }

    /// Drain the log and append it to `path` as JSON lines
    pub async fn archive_to(&self, path: &Path) -> RelayResult<usize> {
        let entries = self.drain().await;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut buf, &ArchiveRecord::from(entry))
                .map_err(std::io::Error::from)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        tracing::info!("Archived {} messages to {:?}", entries.len(), path);
        Ok(entries.len())
    }

    /// Start background task that prunes expired entries until `shutdown` fires
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        if self.retention.max_age.is_none() {
            return;
        }

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let pruned = self.prune_expired().await;
                if pruned > 0 {
                    tracing::debug!("Pruned {} expired messages from the log", pruned);
                }
            }
        });
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(LogRetention::default())
    }
}
