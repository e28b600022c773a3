//! Persistence collaborators.
//!
//! The server only talks to storage through the traits below. `Database`
//! implements all of them on a single SQLite connection.
//!
//! ## Delivery states
//!
//! A direct message is stored either `Delivered` (the recipient was online
//! and the push succeeded) or `Queued`. Queued rows are replayed on the
//! recipient's next login and flipped to `Delivered` one at a time after
//! each push, so a crash in between can redeliver but never lose a message.

mod database;
mod messages;
mod schema;

pub use database::Database;

use crate::error::Result;
use crate::protocol::Frame;
use std::path::Path;

/// What a stored message row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageKind {
    /// Direct text message.
    Text = 0,
    /// File transfer; body is the filename.
    File = 1,
    /// Audio clip; body is the clip name.
    Audio = 2,
}

impl From<i32> for MessageKind {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::File,
            2 => Self::Audio,
            _ => Self::Text,
        }
    }
}

/// Delivery state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageStatus {
    /// Waiting for the recipient to log in.
    Queued = 0,
    /// Pushed to the recipient's live connection.
    Delivered = 1,
}

impl From<i32> for MessageStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Delivered,
            _ => Self::Queued,
        }
    }
}

/// A message waiting for its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Row id, passed back to `mark_delivered`.
    pub id: i64,
    /// The DM frame as sent.
    pub frame: Frame,
    /// Unix timestamp the message was queued.
    pub queued_at: i64,
}

/// One row of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    /// Row id.
    pub id: i64,
    /// Kind of message.
    pub kind: MessageKind,
    /// Author.
    pub sender: String,
    /// Addressee.
    pub recipient: String,
    /// Text, or filename for transfers.
    pub body: String,
    /// Current delivery state.
    pub status: MessageStatus,
    /// Unix timestamp.
    pub timestamp: i64,
}

/// Message persistence.
pub trait MessageStore: Send + Sync {
    /// Store a message in its final state.
    fn save_message(
        &self,
        kind: MessageKind,
        sender: &str,
        recipient: &str,
        body: &str,
        delivered: bool,
    ) -> Result<i64>;

    /// Store a DM frame for later delivery.
    fn save_queued(&self, frame: &Frame) -> Result<i64>;

    /// Queued messages for `recipient`, oldest first.
    fn load_queued(&self, recipient: &str) -> Result<Vec<QueuedMessage>>;

    /// Flip a queued message to delivered.
    fn mark_delivered(&self, id: i64) -> Result<()>;

    /// The last `limit` messages between `a` and `b`, oldest first.
    fn load_conversation(&self, a: &str, b: &str, limit: usize) -> Result<Vec<HistoryRow>>;
}

/// Metadata for reassembled transfers.
pub trait FileStore: Send + Sync {
    /// Record a stored payload against the message that announced it.
    fn save(&self, message_id: i64, name: &str, path: &Path, mime: &str, size: u64) -> Result<i64>;
}

/// Known usernames.
pub trait UserDirectory: Send + Sync {
    /// Whether `name` has ever logged in.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Record a new user, optionally with a password. Returns `false` when
    /// the name was already taken, leaving the existing record untouched.
    fn register(&self, name: &str, password: Option<&str>) -> Result<bool>;

    /// Check a password. Users registered without one accept any login.
    fn verify_credentials(&self, name: &str, password: Option<&str>) -> Result<bool>;
}

/// Room name to id mapping.
pub trait RoomDirectory: Send + Sync {
    /// Id for `name`, created on first use.
    fn room_id(&self, name: &str) -> Result<i64>;
}
