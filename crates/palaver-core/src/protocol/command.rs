//! Text command protocol: parsing inbound lines and rendering outbound ones.
//!
//! One command per line. The verb is case-insensitive; arguments are
//! whitespace-delimited except for trailing free text (`MSG`, `DM`, `ROOM`),
//! which runs to the end of the line.

use super::frame::Frame;
use super::types::{FrameType, SignalBody};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use zeroize::Zeroizing;

/// Login accepted.
pub const OK_LOGIN: &str = "OK LOGIN";
/// Broadcast fanned out.
pub const OK_SENT: &str = "OK SENT";
/// Direct message delivered live.
pub const OK_DM: &str = "OK DM";
/// Direct message stored for later delivery.
pub const OK_QUEUED: &str = "OK QUEUED";
/// History listing complete.
pub const OK_HISTORY: &str = "OK HISTORY";
/// File transfer stored.
pub const OK_FILE_SAVED: &str = "OK FILE_SAVED";
/// Audio transfer stored.
pub const OK_AUDIO_SAVED: &str = "OK AUDIO_SAVED";
/// Call signal relayed.
pub const OK_CALL: &str = "OK CALL";
/// Room message fanned out.
pub const OK_ROOM: &str = "OK ROOM";
/// Reply to QUIT.
pub const BYE: &str = "BYE";

/// Longest accepted username.
pub const MAX_NAME_LEN: usize = 32;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LOGIN <name> [<password>]`
    Login {
        /// Requested username.
        name: String,
        /// Optional password.
        password: Option<Zeroizing<String>>,
    },
    /// `MSG <text>`
    Msg {
        /// Broadcast text.
        text: String,
    },
    /// `DM <to> <text>`
    Dm {
        /// Target username.
        to: String,
        /// Message text.
        text: String,
    },
    /// `HISTORY <peer> [<limit>]`
    History {
        /// Other party of the conversation.
        peer: String,
        /// Requested row count.
        limit: Option<usize>,
    },
    /// `WHO`
    Who,
    /// `QUIT`
    Quit,
    /// `SEND_FILE`
    SendFile,
    /// `SEND_AUDIO`
    SendAudio,
    /// `CALL_<VERB> <to> <callId> [<base64payload>]`
    Call {
        /// Signaling type.
        kind: FrameType,
        /// Callee (or caller, for replies).
        to: String,
        /// Call identifier.
        call_id: String,
        /// Base64 session material, for OFFER/ANSWER/ICE.
        payload: Option<String>,
    },
    /// `JOIN <room>`
    Join {
        /// Room name.
        room: String,
    },
    /// `LEAVE <room>`
    Leave {
        /// Room name.
        room: String,
    },
    /// `ROOM <room> <text>`
    Room {
        /// Room name.
        room: String,
        /// Message text.
        text: String,
    },
    /// `MEMBERS <room>`
    Members {
        /// Room name.
        room: String,
    },
}

/// Why a line could not be turned into a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Blank line.
    #[error("empty command")]
    Empty,
    /// Verb not recognised.
    #[error("unknown command: {0}")]
    Unknown(String),
    /// Verb recognised, arguments malformed. Carries the `ERR` reason.
    #[error("bad arguments for {0}")]
    Usage(&'static str),
}

impl CommandError {
    /// Reason token for the `ERR <REASON>` reply.
    pub fn reason(&self) -> &'static str {
        match self {
            CommandError::Empty => "EMPTY",
            CommandError::Unknown(_) => "UNKNOWN_COMMAND",
            CommandError::Usage(reason) => reason,
        }
    }
}

/// Split off the first whitespace-delimited token.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Trailing free text with the separator removed.
fn free_text(rest: &str) -> &str {
    rest.trim_start().trim_end_matches(['\r', '\n'])
}

/// Whether a username is acceptable.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Parse one command line.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let (verb, rest) = next_token(line).ok_or(CommandError::Empty)?;
    let upper = verb.to_ascii_uppercase();

    match upper.as_str() {
        "LOGIN" => {
            let (name, rest) = next_token(rest).ok_or(CommandError::Usage("LOGIN"))?;
            let password = next_token(rest).map(|(pw, _)| Zeroizing::new(pw.to_string()));
            Ok(Command::Login {
                name: name.to_string(),
                password,
            })
        }
        "MSG" => {
            let text = free_text(rest);
            if text.is_empty() {
                return Err(CommandError::Usage("EMPTY"));
            }
            Ok(Command::Msg {
                text: text.to_string(),
            })
        }
        "DM" => {
            let (to, rest) = next_token(rest).ok_or(CommandError::Usage("DM"))?;
            let text = free_text(rest);
            if text.is_empty() {
                return Err(CommandError::Usage("DM"));
            }
            Ok(Command::Dm {
                to: to.to_string(),
                text: text.to_string(),
            })
        }
        "HISTORY" => {
            let (peer, rest) = next_token(rest).ok_or(CommandError::Usage("HISTORY"))?;
            let limit = match next_token(rest) {
                Some((raw, _)) => Some(
                    raw.parse::<usize>()
                        .map_err(|_| CommandError::Usage("HISTORY"))?,
                ),
                None => None,
            };
            Ok(Command::History {
                peer: peer.to_string(),
                limit,
            })
        }
        "WHO" => Ok(Command::Who),
        "QUIT" => Ok(Command::Quit),
        "SEND_FILE" => Ok(Command::SendFile),
        "SEND_AUDIO" => Ok(Command::SendAudio),
        "JOIN" | "LEAVE" | "MEMBERS" => {
            let (room, _) = next_token(rest).ok_or(CommandError::Usage("ROOM"))?;
            let room = room.to_string();
            Ok(match upper.as_str() {
                "JOIN" => Command::Join { room },
                "LEAVE" => Command::Leave { room },
                _ => Command::Members { room },
            })
        }
        "ROOM" => {
            let (room, rest) = next_token(rest).ok_or(CommandError::Usage("ROOM"))?;
            let text = free_text(rest);
            if text.is_empty() {
                return Err(CommandError::Usage("ROOM"));
            }
            Ok(Command::Room {
                room: room.to_string(),
                text: text.to_string(),
            })
        }
        _ if upper.starts_with("CALL_") => parse_call(&upper, rest),
        _ => Err(CommandError::Unknown(verb.to_string())),
    }
}

fn parse_call(verb: &str, rest: &str) -> Result<Command, CommandError> {
    let kind = FrameType::from_call_verb(verb).ok_or_else(|| CommandError::Unknown(verb.to_string()))?;
    let (to, rest) = next_token(rest).ok_or(CommandError::Usage("CALL"))?;
    let (call_id, rest) = next_token(rest).ok_or(CommandError::Usage("CALL"))?;
    let payload = next_token(rest).map(|(p, _)| p.to_string());

    if kind.carries_session_payload() {
        match &payload {
            Some(p) if BASE64.decode(p).is_ok() => {}
            _ => return Err(CommandError::Usage("BAD_PAYLOAD")),
        }
    }

    Ok(Command::Call {
        kind,
        to: to.to_string(),
        call_id: call_id.to_string(),
        payload,
    })
}

/// `ERR <REASON>` line.
pub fn err_line(reason: &str) -> String {
    format!("ERR {}", reason)
}

/// Extract the call id a signaling frame refers to.
///
/// OFFER/ANSWER/ICE carry it inside their JSON body; the other call types
/// carry it as the whole body.
pub fn call_id_of(frame: &Frame) -> String {
    if frame.frame_type.carries_session_payload() {
        if let Ok(signal) = SignalBody::from_body(&frame.body) {
            return signal.call_id;
        }
    }
    frame.body.clone()
}

/// Render a frame pushed to a client as the text line it receives.
pub fn render_push(frame: &Frame) -> String {
    match frame.frame_type {
        FrameType::Dm => format!("[DM] {}: {}", frame.sender, frame.body),
        FrameType::FileEvt => format!(
            "[FILE] from {} -> {} : {}",
            frame.sender, frame.recipient, frame.body
        ),
        FrameType::AudioEvt => format!(
            "[AUDIO] from {} -> {} : {}",
            frame.sender, frame.recipient, frame.body
        ),
        FrameType::RoomMsg => format!("[ROOM {}] {}: {}", frame.recipient, frame.sender, frame.body),
        ft if ft.carries_session_payload() => match SignalBody::from_body(&frame.body) {
            Ok(signal) => format!("{} {} {} {}", ft, frame.sender, signal.call_id, signal.payload),
            Err(_) => format!("{} {} {}", ft, frame.sender, frame.body),
        },
        ft if ft.is_call_signal() => format!("{} {} {}", ft, frame.sender, frame.body),
        ft => format!("[{}] {}: {}", ft, frame.sender, frame.body),
    }
}
