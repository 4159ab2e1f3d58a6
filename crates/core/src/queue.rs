use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl QueueError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        QueueError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One pending webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Storage key; keys sort in processing order.
    pub key: String,
    pub payload: Vec<u8>,
    /// Failed processing passes so far.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Stored(String),
    /// An item with the same event id is still pending.
    Duplicate(String),
}

impl Enqueued {
    pub fn key(&self) -> &str {
        match self {
            Enqueued::Stored(key) | Enqueued::Duplicate(key) => key,
        }
    }
}

/// Durable, ordered store of pending webhook payloads.
///
/// `peek_oldest` must return the item with the smallest key among those
/// currently stored, and `remove` must tolerate items that are already gone.
pub trait Queue: Send + Sync {
    /// Held while one drain pass runs; dropping it releases the pass.
    type Lease: Send;

    fn enqueue(&self, raw: &[u8]) -> Result<Enqueued, QueueError>;

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError>;

    fn remove(&self, item: &QueueItem) -> Result<(), QueueError>;

    /// Records a failed pass and returns the new attempt count.
    fn record_failure(&self, item: &QueueItem) -> Result<u32, QueueError>;

    /// Moves an item out of the pending set without processing it.
    fn dead_letter(&self, item: &QueueItem, reason: &str) -> Result<(), QueueError>;

    /// `None` when another drain pass holds the lease.
    fn try_lease(&self) -> Result<Option<Self::Lease>, QueueError>;

    fn pending(&self) -> Result<usize, QueueError>;
}

/// Width of numeric keys; `u64::MAX` has 20 digits.
pub const KEY_WIDTH: usize = 20;

/// Storage key for an event id. Numeric ids are zero-padded so lexical order
/// matches numeric order; other ids get no key and the store falls back to an
/// ingestion-time key.
pub fn key_for_id(id: &str) -> Option<String> {
    let id = id.trim();
    if id.is_empty() || id.len() > KEY_WIDTH || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = id.parse().ok()?;
    Some(format!("{value:0width$}", width = KEY_WIDTH))
}
