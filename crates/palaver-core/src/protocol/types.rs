//! Frame type tags and the JSON bodies carried by META and signaling frames.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Closed set of frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// User registration / login announcement.
    Register = 0x01,
    /// Direct message.
    Dm = 0x02,
    /// Acknowledgment.
    Ack = 0x03,
    /// Error notice.
    Error = 0x04,
    /// Presence listing.
    Who = 0x05,
    /// File transfer metadata.
    FileMeta = 0x06,
    /// Audio clip metadata.
    AudioMeta = 0x07,
    /// File payload fragment.
    FileChunk = 0x08,
    /// Audio payload fragment.
    AudioChunk = 0x09,
    /// Conversation history.
    History = 0x0A,
    /// Delete a stored message.
    DeleteMsg = 0x0B,
    /// Edit a stored message.
    EditMsg = 0x0C,
    /// File received notification.
    FileEvt = 0x0D,
    /// Audio received notification.
    AudioEvt = 0x0E,
    /// Ask a peer to start a call.
    CallInvite = 0x0F,
    /// Callee accepted.
    CallAccept = 0x10,
    /// Callee rejected.
    CallReject = 0x11,
    /// Caller gave up before an answer.
    CallCancel = 0x12,
    /// Callee is already in a call.
    CallBusy = 0x13,
    /// Either side hung up.
    CallEnd = 0x14,
    /// Session description offer.
    CallOffer = 0x15,
    /// Session description answer.
    CallAnswer = 0x16,
    /// Connectivity candidate.
    CallIce = 0x17,
    /// Server notice: the callee has no live connection.
    CallOffline = 0x18,
    /// Join a room.
    RoomJoin = 0x19,
    /// Leave a room.
    RoomLeave = 0x1A,
    /// Message to a room.
    RoomMsg = 0x1B,
    /// Room membership listing.
    RoomMembers = 0x1C,
}

impl FrameType {
    /// Every tag, in wire order.
    pub const ALL: [FrameType; 28] = [
        Self::Register,
        Self::Dm,
        Self::Ack,
        Self::Error,
        Self::Who,
        Self::FileMeta,
        Self::AudioMeta,
        Self::FileChunk,
        Self::AudioChunk,
        Self::History,
        Self::DeleteMsg,
        Self::EditMsg,
        Self::FileEvt,
        Self::AudioEvt,
        Self::CallInvite,
        Self::CallAccept,
        Self::CallReject,
        Self::CallCancel,
        Self::CallBusy,
        Self::CallEnd,
        Self::CallOffer,
        Self::CallAnswer,
        Self::CallIce,
        Self::CallOffline,
        Self::RoomJoin,
        Self::RoomLeave,
        Self::RoomMsg,
        Self::RoomMembers,
    ];

    /// Parse a type tag. Unknown tags are a framing error.
    pub fn from_byte(byte: u8) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.to_byte() == byte)
            .ok_or_else(|| Error::Framing(format!("unknown frame type: {:#04x}", byte)))
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Protocol name, as used in text commands and replies.
    pub fn name(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Dm => "DM",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Who => "WHO",
            Self::FileMeta => "FILE_META",
            Self::AudioMeta => "AUDIO_META",
            Self::FileChunk => "FILE_CHUNK",
            Self::AudioChunk => "AUDIO_CHUNK",
            Self::History => "HISTORY",
            Self::DeleteMsg => "DELETE_MSG",
            Self::EditMsg => "EDIT_MSG",
            Self::FileEvt => "FILE_EVT",
            Self::AudioEvt => "AUDIO_EVT",
            Self::CallInvite => "CALL_INVITE",
            Self::CallAccept => "CALL_ACCEPT",
            Self::CallReject => "CALL_REJECT",
            Self::CallCancel => "CALL_CANCEL",
            Self::CallBusy => "CALL_BUSY",
            Self::CallEnd => "CALL_END",
            Self::CallOffer => "CALL_OFFER",
            Self::CallAnswer => "CALL_ANSWER",
            Self::CallIce => "CALL_ICE",
            Self::CallOffline => "CALL_OFFLINE",
            Self::RoomJoin => "ROOM_JOIN",
            Self::RoomLeave => "ROOM_LEAVE",
            Self::RoomMsg => "ROOM_MSG",
            Self::RoomMembers => "ROOM_MEMBERS",
        }
    }

    /// Look up a client-sendable call verb such as `CALL_INVITE`.
    ///
    /// `CALL_OFFLINE` is server-generated and is not accepted here.
    pub fn from_call_verb(verb: &str) -> Option<Self> {
        let upper = verb.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .filter(|t| t.is_call_signal() && *t != Self::CallOffline)
            .find(|t| t.name() == upper)
    }

    /// Whether frames of this type carry the transfer fields.
    pub fn is_chunk(self) -> bool {
        matches!(self, Self::FileChunk | Self::AudioChunk)
    }

    /// Whether this is one of the `CALL_*` signaling types.
    pub fn is_call_signal(self) -> bool {
        (Self::CallInvite.to_byte()..=Self::CallOffline.to_byte()).contains(&self.to_byte())
    }

    /// Whether the body is session material (`{"callId","payload"}`) rather
    /// than a bare call id.
    pub fn carries_session_payload(self) -> bool {
        matches!(self, Self::CallOffer | Self::CallAnswer | Self::CallIce)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Body of a FILE_META frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    /// Client-supplied filename.
    pub name: String,
    /// MIME type.
    #[serde(default = "default_mime")]
    pub mime: String,
    /// Client-minted transfer id; the server mints one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Declared payload size in bytes.
    pub size: u64,
}

/// Body of an AUDIO_META frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMeta {
    /// Codec name, e.g. `pcm_s16le` or `opus`.
    pub codec: String,
    /// Client-minted transfer id; the server mints one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_id: Option<String>,
    /// Declared clip duration.
    pub duration_ms: u64,
    /// Declared payload size in bytes.
    pub size: u64,
}

/// Body of CALL_OFFER / CALL_ANSWER / CALL_ICE frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBody {
    /// Call this material belongs to.
    pub call_id: String,
    /// Opaque base64 session description or candidate, relayed untouched.
    pub payload: String,
}

impl SignalBody {
    /// Serialize to a frame body.
    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a frame body.
    pub fn from_body(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for ft in FrameType::ALL {
            let parsed = FrameType::from_byte(ft.to_byte()).expect("should parse");
            assert_eq!(ft, parsed);
        }
    }

    #[test]
    fn test_unknown_frame_type() {
        assert!(matches!(FrameType::from_byte(0x00), Err(Error::Framing(_))));
        assert!(matches!(FrameType::from_byte(0xFF), Err(Error::Framing(_))));
    }

    #[test]
    fn test_call_verbs() {
        assert_eq!(FrameType::from_call_verb("call_invite"), Some(FrameType::CallInvite));
        assert_eq!(FrameType::from_call_verb("CALL_ICE"), Some(FrameType::CallIce));
        assert_eq!(FrameType::from_call_verb("CALL_OFFLINE"), None);
        assert_eq!(FrameType::from_call_verb("FILE_META"), None);
    }

    #[test]
    fn test_classification() {
        assert!(FrameType::FileChunk.is_chunk());
        assert!(!FrameType::FileMeta.is_chunk());
        assert!(FrameType::CallEnd.is_call_signal());
        assert!(!FrameType::RoomJoin.is_call_signal());
        assert!(FrameType::CallOffer.carries_session_payload());
        assert!(!FrameType::CallInvite.carries_session_payload());
    }

    #[test]
    fn test_file_meta_json() {
        let meta: FileMeta =
            serde_json::from_str(r#"{"name":"a.png","mime":"image/png","fileId":"f1","size":3}"#)
                .expect("should parse");
        assert_eq!(meta.file_id.as_deref(), Some("f1"));
        assert_eq!(meta.size, 3);

        let meta: FileMeta = serde_json::from_str(r#"{"name":"x","size":0}"#).expect("should parse");
        assert_eq!(meta.mime, "application/octet-stream");
        assert!(meta.file_id.is_none());
    }
}
