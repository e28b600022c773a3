//! Server configuration.

use crate::protocol::MAX_FRAME_LEN;
use std::path::PathBuf;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:5555";

/// Largest accepted file transfer (25 MiB).
pub const MAX_FILE_BYTES: u64 = 25 * 1024 * 1024;

/// Longest accepted audio clip.
pub const MAX_AUDIO_MS: u64 = 30_000;

/// Byte budget per second of audio: 48 kHz, 16-bit, stereo PCM.
pub const AUDIO_BYTES_PER_SEC: u64 = 48_000 * 2 * 2;

/// Default number of history rows.
pub const DEFAULT_HISTORY: usize = 50;

/// Upper clamp on history rows.
pub const MAX_HISTORY: usize = 500;

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "palaver.db";

/// Runtime configuration for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the accept loop binds to.
    pub listen: String,
    /// Directory reassembled transfers are written to.
    pub upload_dir: PathBuf,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Envelope bound for a single frame.
    pub max_frame_len: usize,
    /// Ceiling on a file transfer.
    pub max_file_bytes: u64,
    /// Ceiling on declared audio duration.
    pub max_audio_ms: u64,
    /// Ceiling on audio bytes received.
    pub max_audio_bytes: u64,
    /// History rows returned when no limit is given.
    pub default_history: usize,
    /// History rows returned at most.
    pub max_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::with_data_dir(".")
    }
}

impl ServerConfig {
    /// Defaults with the database and uploads placed under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            upload_dir: data_dir.join("uploads"),
            db_path: data_dir.join(DEFAULT_DB_NAME),
            max_frame_len: MAX_FRAME_LEN,
            max_file_bytes: MAX_FILE_BYTES,
            max_audio_ms: MAX_AUDIO_MS,
            max_audio_bytes: audio_budget(MAX_AUDIO_MS),
            default_history: DEFAULT_HISTORY,
            max_history: MAX_HISTORY,
        }
    }

    /// Set the audio duration ceiling and the matching byte budget.
    pub fn set_max_audio_ms(&mut self, ms: u64) {
        self.max_audio_ms = ms;
        self.max_audio_bytes = audio_budget(ms);
    }

    /// Resolve a requested history limit against the defaults.
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_history)
            .clamp(1, self.max_history)
    }
}

/// Byte budget for a clip of the given duration.
pub fn audio_budget(ms: u64) -> u64 {
    ms.saturating_mul(AUDIO_BYTES_PER_SEC) / 1000
}
