//! File and audio transfer sub-sessions.
//!
//! After `SEND_FILE` or `SEND_AUDIO` the connection stops reading lines and
//! reads frames instead: one META frame, then chunks until `last`. The
//! payload is only written to disk once the final chunk has been checked,
//! so a rejected transfer leaves nothing behind.
//!
//! ```text
//!   META ──► CHUNK seq=0 ──► CHUNK seq=1 ──► ... ──► CHUNK seq=k last
//!    │           │                                        │
//!    │      (id, seq, size checked per chunk)             ▼
//!    │                                             write + store + notify
//!    └── violation anywhere: ERR *_FAIL, drain to the last chunk
//! ```
//!
//! A rejected META is only followed by a drain when it declared its own
//! transfer id. Without one the client is still waiting for `READY` and has
//! sent no chunks.

use super::handle::ConnectionHandle;
use super::ServerContext;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use crate::protocol::{
    err_line, is_valid_name, AudioMeta, FileMeta, Frame, FrameType, OK_AUDIO_SAVED, OK_FILE_SAVED,
};
use crate::storage::MessageKind;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Longest accepted transfer id.
pub const MAX_TRANSFER_ID_LEN: usize = 64;

/// Chunk buffer reserved up front, regardless of the declared size.
const INITIAL_BUFFER: usize = 64 * 1024;

/// File or audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// `SEND_FILE`
    File,
    /// `SEND_AUDIO`
    Audio,
}

impl TransferKind {
    /// META frame type that opens the sub-session.
    pub fn meta_type(self) -> FrameType {
        match self {
            TransferKind::File => FrameType::FileMeta,
            TransferKind::Audio => FrameType::AudioMeta,
        }
    }

    /// Chunk frame type carrying the payload.
    pub fn chunk_type(self) -> FrameType {
        match self {
            TransferKind::File => FrameType::FileChunk,
            TransferKind::Audio => FrameType::AudioChunk,
        }
    }

    /// Event pushed to an online recipient.
    pub fn event_type(self) -> FrameType {
        match self {
            TransferKind::File => FrameType::FileEvt,
            TransferKind::Audio => FrameType::AudioEvt,
        }
    }

    /// Terminal success reply.
    pub fn ok_reply(self) -> &'static str {
        match self {
            TransferKind::File => OK_FILE_SAVED,
            TransferKind::Audio => OK_AUDIO_SAVED,
        }
    }

    /// Reason token of the terminal failure reply.
    pub fn fail_reason(self) -> &'static str {
        match self {
            TransferKind::File => "FILE_FAIL",
            TransferKind::Audio => "AUDIO_FAIL",
        }
    }

    /// META body field carrying a client-chosen transfer id.
    pub fn id_field(self) -> &'static str {
        match self {
            TransferKind::File => "fileId",
            TransferKind::Audio => "audioId",
        }
    }

    /// Message kind recorded in the store.
    pub fn message_kind(self) -> MessageKind {
        match self {
            TransferKind::File => MessageKind::File,
            TransferKind::Audio => MessageKind::Audio,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::File => "file",
            TransferKind::Audio => "audio",
        })
    }
}

/// Why a sub-session was aborted. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// A frame of the wrong type arrived.
    #[error("expected {expected} frame, got {found}")]
    UnexpectedFrame {
        /// Type the sub-session was waiting for.
        expected: FrameType,
        /// Type that arrived.
        found: FrameType,
    },

    /// A chunk belongs to a different transfer.
    #[error("chunk for transfer {found:?}, expected {expected:?}")]
    WrongTransferId {
        /// Id declared by META.
        expected: String,
        /// Id on the chunk.
        found: String,
    },

    /// A chunk arrived out of sequence.
    #[error("chunk seq {found}, expected {expected}")]
    OutOfOrder {
        /// Next sequence number.
        expected: u32,
        /// Sequence number on the chunk.
        found: u32,
    },

    /// Declared or received size exceeds what is allowed.
    #[error("transfer of {actual} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Bytes allowed.
        limit: u64,
        /// Bytes declared or received so far.
        actual: u64,
    },

    /// The last chunk arrived short of the declared size.
    #[error("received {received} bytes, declared {declared}")]
    SizeMismatch {
        /// Declared size.
        declared: u64,
        /// Bytes received.
        received: u64,
    },

    /// Audio clip longer than allowed.
    #[error("clip of {duration_ms} ms exceeds {limit_ms} ms")]
    DurationTooLong {
        /// Declared duration.
        duration_ms: u64,
        /// Allowed duration.
        limit_ms: u64,
    },

    /// META body or addressing unusable.
    #[error("invalid metadata: {0}")]
    InvalidMeta(String),

    /// Writing or recording the payload failed.
    #[error("storage failed: {0}")]
    Store(String),
}

/// Everything META settled about a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    /// File or audio.
    pub kind: TransferKind,
    /// Id every chunk must carry.
    pub transfer_id: String,
    /// Whether the server minted the id.
    pub minted: bool,
    /// Sanitised name recorded and shown to the recipient.
    pub name: String,
    /// MIME type recorded with the payload.
    pub mime: String,
    /// Exact number of payload bytes expected.
    pub declared_size: u64,
    /// Addressee.
    pub recipient: String,
}

impl TransferPlan {
    /// Validate a META frame against the configured limits.
    pub fn from_meta(
        kind: TransferKind,
        frame: &Frame,
        config: &ServerConfig,
    ) -> std::result::Result<Self, TransferError> {
        if frame.frame_type != kind.meta_type() {
            return Err(TransferError::UnexpectedFrame {
                expected: kind.meta_type(),
                found: frame.frame_type,
            });
        }
        if !is_valid_name(&frame.recipient) {
            return Err(TransferError::InvalidMeta(format!(
                "bad recipient {:?}",
                frame.recipient
            )));
        }

        let (client_id, name, mime, declared_size) = match kind {
            TransferKind::File => {
                let meta: FileMeta = serde_json::from_str(&frame.body)
                    .map_err(|e| TransferError::InvalidMeta(e.to_string()))?;
                if meta.size > config.max_file_bytes {
                    return Err(TransferError::TooLarge {
                        limit: config.max_file_bytes,
                        actual: meta.size,
                    });
                }
                (meta.file_id, Some(sanitize_filename(&meta.name)), meta.mime, meta.size)
            }
            TransferKind::Audio => {
                let meta: AudioMeta = serde_json::from_str(&frame.body)
                    .map_err(|e| TransferError::InvalidMeta(e.to_string()))?;
                if meta.duration_ms > config.max_audio_ms {
                    return Err(TransferError::DurationTooLong {
                        duration_ms: meta.duration_ms,
                        limit_ms: config.max_audio_ms,
                    });
                }
                if meta.size > config.max_audio_bytes {
                    return Err(TransferError::TooLarge {
                        limit: config.max_audio_bytes,
                        actual: meta.size,
                    });
                }
                if !is_token(&meta.codec, 32) {
                    return Err(TransferError::InvalidMeta(format!(
                        "bad codec {:?}",
                        meta.codec
                    )));
                }
                let mime = format!("audio/{}", meta.codec);
                (meta.audio_id, None, mime, meta.size)
            }
        };

        let (transfer_id, minted) = match client_id {
            Some(id) if is_token(&id, MAX_TRANSFER_ID_LEN) => (id, false),
            Some(id) => {
                return Err(TransferError::InvalidMeta(format!("bad transfer id {:?}", id)));
            }
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

        // Audio clips are named after their id.
        let name = match name {
            Some(name) => name,
            None => format!("{}.{}", transfer_id, mime.trim_start_matches("audio/")),
        };

        Ok(Self {
            kind,
            transfer_id,
            minted,
            name,
            mime,
            declared_size,
            recipient: frame.recipient.clone(),
        })
    }
}

/// Checks chunks in arrival order and accumulates their payload.
#[derive(Debug)]
pub struct Reassembler {
    plan: TransferPlan,
    next_seq: u32,
    buf: Vec<u8>,
}

impl Reassembler {
    /// Start reassembling the transfer described by `plan`.
    pub fn new(plan: TransferPlan) -> Self {
        let reserve = plan.declared_size.min(INITIAL_BUFFER as u64) as usize;
        Self {
            plan,
            next_seq: 0,
            buf: Vec::with_capacity(reserve),
        }
    }

    /// The plan being fulfilled.
    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Payload bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Accept the next chunk. Returns `true` once the last chunk is in.
    pub fn accept(&mut self, frame: &Frame) -> std::result::Result<bool, TransferError> {
        let expected = self.plan.kind.chunk_type();
        let chunk = match (&frame.chunk, frame.frame_type == expected) {
            (Some(chunk), true) => chunk,
            _ => {
                return Err(TransferError::UnexpectedFrame {
                    expected,
                    found: frame.frame_type,
                })
            }
        };

        if chunk.transfer_id != self.plan.transfer_id {
            return Err(TransferError::WrongTransferId {
                expected: self.plan.transfer_id.clone(),
                found: chunk.transfer_id.clone(),
            });
        }
        if chunk.seq != self.next_seq {
            return Err(TransferError::OutOfOrder {
                expected: self.next_seq,
                found: chunk.seq,
            });
        }

        let total = self.received() + chunk.bin.len() as u64;
        if total > self.plan.declared_size {
            return Err(TransferError::TooLarge {
                limit: self.plan.declared_size,
                actual: total,
            });
        }

        self.buf.extend_from_slice(&chunk.bin);
        self.next_seq = self.next_seq.saturating_add(1);

        if chunk.last {
            if total != self.plan.declared_size {
                return Err(TransferError::SizeMismatch {
                    declared: self.plan.declared_size,
                    received: total,
                });
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand over the plan and the complete payload.
    pub fn finish(self) -> (TransferPlan, Vec<u8>) {
        (self.plan, self.buf)
    }
}

/// Run one sub-session on `reader`, replying through `handle`.
///
/// Exactly one terminal reply is sent unless the connection itself fails,
/// in which case the error is returned and the caller closes it.
pub async fn run_transfer<R>(
    kind: TransferKind,
    reader: &mut R,
    ctx: &ServerContext,
    user: &str,
    handle: &ConnectionHandle,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let meta = next_frame(reader, ctx).await?;
    let plan = match TransferPlan::from_meta(kind, &meta, &ctx.config).and_then(|plan| {
        known_recipient(ctx, &plan.recipient)?;
        Ok(plan)
    }) {
        Ok(plan) => plan,
        Err(e) => {
            let drain = chunks_may_follow(kind, &meta);
            return abort(kind, e, drain, reader, ctx, user, handle).await;
        }
    };

    debug!(
        kind = %kind,
        transfer = %plan.transfer_id,
        from = %user,
        to = %plan.recipient,
        size = plan.declared_size,
        "Transfer started"
    );
    if plan.minted {
        handle
            .send_line(&format!("READY {}", plan.transfer_id))
            .await?;
    }

    let mut reassembler = Reassembler::new(plan);
    loop {
        let frame = next_frame(reader, ctx).await?;
        match reassembler.accept(&frame) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                let drain = !frame.is_last_chunk();
                return abort(kind, e, drain, reader, ctx, user, handle).await;
            }
        }
    }

    let (plan, payload) = reassembler.finish();
    match store(ctx, user, &plan, &payload).await {
        Ok(message_id) => {
            info!(
                kind = %kind,
                transfer = %plan.transfer_id,
                message_id,
                from = %user,
                to = %plan.recipient,
                payload = %RedactedBytes(&payload),
                "Transfer stored"
            );
            notify(ctx, user, &plan).await;
            handle.send_line(kind.ok_reply()).await
        }
        Err(e) => {
            warn!(kind = %kind, transfer = %plan.transfer_id, error = %e, "Transfer could not be stored");
            handle.send_line(&err_line(kind.fail_reason())).await
        }
    }
}

async fn next_frame<R>(reader: &mut R, ctx: &ServerContext) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    ctx.codec.read(reader).await?.ok_or(Error::ConnectionClosed)
}

fn known_recipient(ctx: &ServerContext, name: &str) -> std::result::Result<(), TransferError> {
    if ctx.presence.is_online(name) {
        return Ok(());
    }
    match ctx.users.exists(name) {
        Ok(true) => Ok(()),
        Ok(false) => Err(TransferError::InvalidMeta(format!("unknown recipient {}", name))),
        Err(e) => Err(TransferError::Store(e.to_string())),
    }
}

/// Whether chunks may already be on the wire behind a rejected META.
///
/// Chunks carry the transfer id, so a client that left the id to the server
/// cannot have built any before `READY`.
fn chunks_may_follow(kind: TransferKind, meta: &Frame) -> bool {
    if meta.frame_type != kind.meta_type() {
        return meta.chunk.is_some() && !meta.is_last_chunk();
    }
    serde_json::from_str::<serde_json::Value>(&meta.body)
        .ok()
        .and_then(|body| body.get(kind.id_field()).map(|id| !id.is_null()))
        .unwrap_or(false)
}

/// Reply with the failure. With `drain` set, also skip frames up to and
/// including the last chunk so the stream is back on a line boundary.
async fn abort<R>(
    kind: TransferKind,
    err: TransferError,
    drain: bool,
    reader: &mut R,
    ctx: &ServerContext,
    user: &str,
    handle: &ConnectionHandle,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    warn!(kind = %kind, user = %user, error = %err, "Transfer rejected");
    handle.send_line(&err_line(kind.fail_reason())).await?;

    let mut skipped = 0usize;
    if drain {
        loop {
            let frame = next_frame(reader, ctx).await?;
            skipped += 1;
            if frame.is_last_chunk() {
                break;
            }
        }
    }
    debug!(kind = %kind, user = %user, skipped, "Drained rejected transfer");
    Ok(())
}

async fn store(
    ctx: &ServerContext,
    user: &str,
    plan: &TransferPlan,
    payload: &[u8],
) -> std::result::Result<i64, TransferError> {
    let path = upload_path(&ctx.config, &plan.name);
    let io_err = |e: std::io::Error| TransferError::Store(e.to_string());
    tokio::fs::create_dir_all(&ctx.config.upload_dir)
        .await
        .map_err(io_err)?;
    write_new(&path, payload).await.map_err(io_err)?;

    let delivered = ctx.presence.is_online(&plan.recipient);
    let recorded = ctx
        .messages
        .save_message(plan.kind.message_kind(), user, &plan.recipient, &plan.name, delivered)
        .and_then(|message_id| {
            ctx.files
                .save(message_id, &plan.name, &path, &plan.mime, plan.declared_size)
                .map(|_| message_id)
        });

    match recorded {
        Ok(message_id) => Ok(message_id),
        Err(e) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(TransferError::Store(e.to_string()))
        }
    }
}

async fn notify(ctx: &ServerContext, user: &str, plan: &TransferPlan) {
    let Some(peer) = ctx.presence.lookup(&plan.recipient) else {
        return;
    };
    let event = Frame::new(plan.kind.event_type(), user, plan.recipient.as_str(), plan.name.as_str());
    if let Err(e) = peer.push(&event).await {
        debug!(to = %plan.recipient, error = %e, "Transfer notification not delivered");
    }
}

/// Fresh location for a payload named `name`.
///
/// Transfer ids and names come from clients and repeat across senders, so
/// every stored payload gets its own server-minted prefix.
pub fn upload_path(config: &ServerConfig, name: &str) -> PathBuf {
    config
        .upload_dir
        .join(format!("{}_{}", uuid::Uuid::new_v4(), name))
}

/// Write `payload` to a file that must not exist yet.
async fn write_new(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(payload).await?;
    file.flush().await
}

/// Strip path separators and leading dots from a client-supplied name.
pub fn sanitize_filename(name: &str) -> String {
    let name = name.replace(['/', '\\', '\0'], "_");
    let name = name.trim_start_matches('.');

    if name.is_empty() {
        format!("file_{}", chrono::Utc::now().timestamp())
    } else {
        name.to_string()
    }
}

fn is_token(s: &str, max_len: usize) -> bool {
    !s.is_empty()
        && s.len() <= max_len
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
