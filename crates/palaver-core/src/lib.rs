//! # Palaver Core Library
//!
//! Server side of a TCP chat and call-signaling service. One socket per
//! client carries three interleaved concerns:
//!
//! - a line-oriented text command protocol (login, broadcast, direct
//!   messages, history, rooms)
//! - a length-prefixed binary frame protocol for chunked file and audio
//!   transfers
//! - call-signaling messages relayed between online peers so they can set
//!   up a direct media session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        server (accept loop, actors)     │
//! ├─────────────────────────────────────────┤
//! │  presence  │   rooms   │  call router   │
//! ├─────────────────────────────────────────┤
//! │      protocol (frames, commands)        │
//! ├─────────────────────────────────────────┤
//! │               storage                   │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod storage;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::{Server, ServerContext};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
