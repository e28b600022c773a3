//! Wire protocol.
//!
//! Two sub-protocols share one byte stream:
//!
//! - text commands, one UTF-8 line each (`command`)
//! - length-prefixed binary frames for transfers (`frame`)
//!
//! ## Frame Structure
//!
//! ```text
//! ┌────────────┬─────┬───────────┬──────────────┬─────────┬─────────────────────┐
//! │ totalLength│ tag │ senderLen │ recipientLen │ bodyLen │ sender recip body   │
//! │  (int32)   │ (u8)│  (u16)    │   (u16)      │ (int32) │ (UTF-8)             │
//! └────────────┴─────┴───────────┴──────────────┴─────────┴─────────────────────┘
//!   chunk types only:
//! ┌───────────┬──────────────┬─────────┬──────────┬────────┬─────────┐
//! │ idLen(u16)│ transferId   │ seq(i32)│ last(u8) │ binLen │ bin     │
//! └───────────┴──────────────┴─────────┴──────────┴────────┴─────────┘
//! ```
//!
//! All integers big-endian. Maximum envelope: 4 MiB.

mod command;
mod frame;
mod types;

pub use command::{
    call_id_of, err_line, is_valid_name, parse_command, render_push, Command, CommandError, BYE,
    MAX_NAME_LEN, OK_AUDIO_SAVED, OK_CALL, OK_DM, OK_FILE_SAVED, OK_HISTORY, OK_LOGIN, OK_QUEUED,
    OK_ROOM, OK_SENT,
};
pub use frame::{
    ChunkFields, Frame, FrameCodec, CHUNK_TRAILER_SIZE, FIXED_HEADER_SIZE, LENGTH_PREFIX_SIZE,
    MAX_FRAME_LEN,
};
pub use types::{AudioMeta, FileMeta, FrameType, SignalBody};
