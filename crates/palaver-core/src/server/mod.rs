//! TCP server: accept loop, shared state and per-connection actors.
//!
//! ## Layout
//!
//! ```text
//!   Server ── accept ──► tokio task per socket
//!                          │
//!                          ├── ConnectionActor   (reads lines / frames)
//!                          └── ConnectionHandle  (serialized writes)
//!
//!   ServerContext (shared, Arc)
//!     ├── PresenceRegistry   username -> handle
//!     ├── RoomRegistry       room id  -> members
//!     ├── CallRouter         signal relay over presence
//!     └── stores             MessageStore, FileStore, UserDirectory
//! ```
//!
//! The registries are the only state shared between connections, and both
//! are sharded concurrent maps. Nothing holds a map guard across an await.

mod call_router;
mod connection;
mod handle;
mod presence;
mod rooms;
mod transfer;

pub use call_router::{CallRouter, RouteOutcome};
pub use connection::{ConnectionActor, MAX_LINE_LEN};
pub use handle::ConnectionHandle;
pub use presence::PresenceRegistry;
pub use rooms::RoomRegistry;
pub use transfer::{
    run_transfer, sanitize_filename, upload_path, Reassembler, TransferError, TransferKind,
    TransferPlan, MAX_TRANSFER_ID_LEN,
};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::FrameCodec;
use crate::storage::{Database, FileStore, MessageStore, RoomDirectory, UserDirectory};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Everything a connection needs, built once and shared.
pub struct ServerContext {
    /// Limits and paths.
    pub config: ServerConfig,
    /// Frame codec bound to `config.max_frame_len`.
    pub codec: FrameCodec,
    /// Online users.
    pub presence: Arc<PresenceRegistry>,
    /// Room membership.
    pub rooms: RoomRegistry,
    /// Call signal relay.
    pub router: CallRouter,
    /// Message persistence.
    pub messages: Arc<dyn MessageStore>,
    /// Transfer payload records.
    pub files: Arc<dyn FileStore>,
    /// Account lookup.
    pub users: Arc<dyn UserDirectory>,
}

impl ServerContext {
    /// Wire up a context from individual collaborators.
    pub fn new(
        config: ServerConfig,
        messages: Arc<dyn MessageStore>,
        files: Arc<dyn FileStore>,
        users: Arc<dyn UserDirectory>,
        room_directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        Self {
            codec: FrameCodec::new(config.max_frame_len),
            router: CallRouter::new(Arc::clone(&presence)),
            rooms: RoomRegistry::new(room_directory),
            presence,
            messages,
            files,
            users,
            config,
        }
    }

    /// Use one database for every collaborator.
    pub fn with_database(config: ServerConfig, db: Database) -> Self {
        let db = Arc::new(db);
        Self::new(
            config,
            Arc::clone(&db) as Arc<dyn MessageStore>,
            Arc::clone(&db) as Arc<dyn FileStore>,
            Arc::clone(&db) as Arc<dyn UserDirectory>,
            db,
        )
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("online", &self.presence.len())
            .field("rooms", &self.rooms)
            .finish_non_exhaustive()
    }
}

/// Bound listener plus the context every accepted connection shares.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind to `ctx.config.listen`.
    pub async fn bind(ctx: ServerContext) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.config.listen).await?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared context.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections forever, one task each.
    pub async fn run(self) -> Result<()> {
        info!(address = %self.local_addr()?, "Listening for connections");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        serve_connection(ctx, stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_connection(ctx: Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    debug!(?addr, "New connection");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(?addr, error = %e, "Could not set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let handle = ConnectionHandle::new(write_half, Some(addr));
    let conn_id = handle.id();

    match ConnectionActor::new(ctx, read_half, handle).run().await {
        Ok(()) => debug!(?addr, conn = conn_id, "Connection closed"),
        Err(e @ Error::Framing(_)) => {
            warn!(?addr, conn = conn_id, error = %e, "Connection dropped on framing error")
        }
        Err(e) if e.is_fatal() => debug!(?addr, conn = conn_id, error = %e, "Connection ended"),
        Err(e) => warn!(?addr, conn = conn_id, error = %e, "Connection ended on unexpected error"),
    }
}
