//! Per-connection command loop.
//!
//! The read half is wrapped in one `BufReader` for the lifetime of the
//! connection. Command lines and transfer frames are both read through it,
//! so whatever was buffered while reading a line is still there when the
//! frame reader takes over, and the other way round.

use super::call_router::RouteOutcome;
use super::handle::ConnectionHandle;
use super::transfer::{run_transfer, TransferKind};
use super::ServerContext;
use crate::error::{Error, Result};
use crate::logging::redact_command;
use crate::protocol::{
    err_line, is_valid_name, parse_command, Command, CommandError, Frame, FrameType, SignalBody,
    BYE, OK_CALL, OK_DM, OK_HISTORY, OK_LOGIN, OK_QUEUED, OK_ROOM, OK_SENT,
};
use crate::storage::MessageKind;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Longest command line accepted, newline included.
pub const MAX_LINE_LEN: usize = 64 * 1024;

enum Flow {
    Continue,
    Quit,
}

/// Serves one client from accept to disconnect.
pub struct ConnectionActor<R> {
    ctx: Arc<ServerContext>,
    reader: BufReader<R>,
    handle: Arc<ConnectionHandle>,
    user: Option<String>,
}

impl<R> ConnectionActor<R>
where
    R: AsyncRead + Unpin,
{
    /// Create an actor reading from `reader` and replying through `handle`.
    pub fn new(ctx: Arc<ServerContext>, reader: R, handle: Arc<ConnectionHandle>) -> Self {
        Self {
            ctx,
            reader: BufReader::new(reader),
            handle,
            user: None,
        }
    }

    /// Run until the client quits, disconnects, or breaks framing.
    ///
    /// Presence and room membership are released on every exit path.
    pub async fn run(mut self) -> Result<()> {
        let result = self.command_loop().await;
        self.cleanup().await;
        result
    }

    async fn command_loop(&mut self) -> Result<()> {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let n = (&mut self.reader)
                .take(MAX_LINE_LEN as u64)
                .read_until(b'\n', &mut raw)
                .await?;
            if n == 0 {
                return Ok(());
            }
            if n >= MAX_LINE_LEN && raw.last() != Some(&b'\n') {
                return Err(Error::Framing(format!(
                    "command line longer than {} bytes",
                    MAX_LINE_LEN
                )));
            }

            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim_end_matches(['\r', '\n']),
                Err(_) => {
                    self.reply(&err_line("ENCODING")).await?;
                    continue;
                }
            };

            if let Flow::Quit = self.dispatch(line).await? {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow> {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(CommandError::Empty) => return Ok(Flow::Continue),
            Err(e) => {
                debug!(conn = self.handle.id(), error = %e, "Rejected command");
                self.reply(&err_line(e.reason())).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!(conn = self.handle.id(), command = %redact_command(line), "Command received");

        match &command {
            Command::Quit => {
                self.reply(BYE).await?;
                return Ok(Flow::Quit);
            }
            Command::Login { name, password } => {
                if self.user.is_some() {
                    self.reply(&err_line("ALREADY_LOGGED_IN")).await?;
                } else {
                    self.login(name, password.as_ref()).await?;
                }
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        let Some(user) = self.user.clone() else {
            self.reply(&err_line("NOT_LOGGED_IN")).await?;
            return Ok(Flow::Continue);
        };

        match command {
            Command::Msg { text } => self.broadcast(&user, &text).await?,
            Command::Dm { to, text } => self.direct_message(&user, &to, text).await?,
            Command::History { peer, limit } => self.history(&user, &peer, limit).await?,
            Command::Who => {
                let names = self.ctx.presence.online_names().join(",");
                self.reply(&format!("ONLINE {}", names)).await?;
            }
            Command::SendFile => self.transfer(TransferKind::File, &user).await?,
            Command::SendAudio => self.transfer(TransferKind::Audio, &user).await?,
            Command::Call {
                kind,
                to,
                call_id,
                payload,
            } => self.call(&user, kind, &to, call_id, payload).await?,
            Command::Join { room } => self.join(&user, &room).await?,
            Command::Leave { room } => self.leave(&room).await?,
            Command::Room { room, text } => self.room_message(&user, &room, &text).await?,
            Command::Members { room } => self.members(&room).await?,
            Command::Login { .. } | Command::Quit => {}
        }
        Ok(Flow::Continue)
    }

    async fn reply(&self, line: &str) -> Result<()> {
        self.handle.send_line(line).await
    }

    async fn storage_failed(&self, what: &str, e: Error) -> Result<()> {
        warn!(conn = self.handle.id(), error = %e, "{} failed", what);
        self.reply(&err_line("STORAGE")).await
    }

    async fn login(&mut self, name: &str, password: Option<&Zeroizing<String>>) -> Result<()> {
        if !is_valid_name(name) {
            return self.reply(&err_line("LOGIN")).await;
        }
        let password = password.map(|p| p.as_str());

        let credentials = match self.ctx.users.exists(name) {
            Ok(true) => self.ctx.users.verify_credentials(name, password),
            Ok(false) => match self.ctx.users.register(name, password) {
                Ok(true) => Ok(true),
                // Another login created the name after our lookup.
                Ok(false) => self.ctx.users.verify_credentials(name, password),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match credentials {
            Ok(true) => {}
            Ok(false) => {
                info!(user = %name, "Login rejected: bad credentials");
                return self.reply(&err_line("LOGIN")).await;
            }
            Err(e) => return self.storage_failed("Login lookup", e).await,
        }

        if !self
            .ctx
            .presence
            .try_register(name, Arc::clone(&self.handle))
        {
            info!(user = %name, "Login rejected: already online");
            return self.reply(&err_line("LOGIN")).await;
        }
        self.user = Some(name.to_string());
        info!(user = %name, conn = self.handle.id(), peer = ?self.handle.peer(), "User logged in");

        self.reply(&format!("{} {}", OK_LOGIN, name)).await?;

        let announcement = format!("[JOIN] {}", name);
        for other in self.ctx.presence.others(self.handle.id()) {
            let _ = other.send_line(&announcement).await;
        }

        self.deliver_queued(name).await
    }

    async fn deliver_queued(&self, name: &str) -> Result<()> {
        let queued = match self.ctx.messages.load_queued(name) {
            Ok(queued) => queued,
            Err(e) => {
                warn!(user = %name, error = %e, "Could not load queued messages");
                return Ok(());
            }
        };
        if queued.is_empty() {
            return Ok(());
        }

        let count = queued.len();
        for message in queued {
            self.handle.push(&message.frame).await?;
            if let Err(e) = self.ctx.messages.mark_delivered(message.id) {
                warn!(user = %name, message_id = message.id, error = %e, "Could not mark message delivered");
            }
        }
        info!(user = %name, count, "Delivered queued messages");
        Ok(())
    }

    async fn broadcast(&self, user: &str, text: &str) -> Result<()> {
        let line = format!("[MSG] {}: {}", user, text);
        let mut reached = 0usize;
        for other in self.ctx.presence.others(self.handle.id()) {
            if other.send_line(&line).await.is_ok() {
                reached += 1;
            }
        }
        debug!(from = %user, reached, "Broadcast sent");
        self.reply(OK_SENT).await
    }

    async fn direct_message(&self, user: &str, to: &str, text: String) -> Result<()> {
        if !is_valid_name(to) {
            return self.reply(&err_line("UNKNOWN_USER")).await;
        }
        let frame = Frame::new(FrameType::Dm, user, to, text);

        if let Some(peer) = self.ctx.presence.lookup(to) {
            match peer.push(&frame).await {
                Ok(()) => {
                    if let Err(e) =
                        self.ctx
                            .messages
                            .save_message(MessageKind::Text, user, to, &frame.body, true)
                    {
                        warn!(from = %user, to = %to, error = %e, "Delivered DM not recorded");
                    }
                    debug!(from = %user, to = %to, "DM delivered");
                    return self.reply(OK_DM).await;
                }
                Err(e) => {
                    // Recipient vanished between lookup and write.
                    debug!(from = %user, to = %to, error = %e, "DM push failed, queuing");
                }
            }
        } else {
            match self.ctx.users.exists(to) {
                Ok(true) => {}
                Ok(false) => return self.reply(&err_line("UNKNOWN_USER")).await,
                Err(e) => return self.storage_failed("User lookup", e).await,
            }
        }

        match self.ctx.messages.save_queued(&frame) {
            Ok(id) => {
                debug!(from = %user, to = %to, message_id = id, "DM queued");
                self.reply(OK_QUEUED).await
            }
            Err(e) => self.storage_failed("Queue DM", e).await,
        }
    }

    async fn history(&self, user: &str, peer: &str, limit: Option<usize>) -> Result<()> {
        if !is_valid_name(peer) {
            return self.reply(&err_line("HISTORY")).await;
        }
        let limit = self.ctx.config.history_limit(limit);
        let rows = match self.ctx.messages.load_conversation(user, peer, limit) {
            Ok(rows) => rows,
            Err(e) => return self.storage_failed("History", e).await,
        };

        for row in rows {
            let direction = if row.sender == user { "OUT" } else { "IN" };
            let body = match row.kind {
                MessageKind::Text => row.body,
                MessageKind::File => format!("[file] {}", row.body),
                MessageKind::Audio => format!("[audio] {}", row.body),
            };
            self.reply(&format!("[HIST {}] {}: {}", direction, peer, body))
                .await?;
        }
        self.reply(OK_HISTORY).await
    }

    async fn transfer(&mut self, kind: TransferKind, user: &str) -> Result<()> {
        run_transfer(kind, &mut self.reader, &self.ctx, user, &self.handle).await
    }

    async fn call(
        &self,
        user: &str,
        kind: FrameType,
        to: &str,
        call_id: String,
        payload: Option<String>,
    ) -> Result<()> {
        if !is_valid_name(to) || to == user {
            return self.reply(&err_line("CALL")).await;
        }

        let body = if kind.carries_session_payload() {
            SignalBody {
                call_id,
                payload: payload.unwrap_or_default(),
            }
            .to_body()?
        } else {
            call_id
        };

        let frame = Frame::new(kind, user, to, body);
        match self.ctx.router.route(user, &self.handle, frame).await? {
            RouteOutcome::Delivered => self.reply(OK_CALL).await,
            // CALL_OFFLINE already went out as the reply.
            RouteOutcome::Offline => Ok(()),
        }
    }

    async fn join(&self, user: &str, room: &str) -> Result<()> {
        if !is_valid_name(room) {
            return self.reply(&err_line("ROOM")).await;
        }
        match self.ctx.rooms.join(room, user, Arc::clone(&self.handle)) {
            Ok(_) => self.reply(&format!("OK JOIN {}", room)).await,
            Err(e) => self.storage_failed("Room join", e).await,
        }
    }

    async fn leave(&self, room: &str) -> Result<()> {
        if !is_valid_name(room) {
            return self.reply(&err_line("ROOM")).await;
        }
        match self.ctx.rooms.leave(room, self.handle.id()) {
            Ok(true) => self.reply(&format!("OK LEAVE {}", room)).await,
            Ok(false) => self.reply(&err_line("ROOM")).await,
            Err(e) => self.storage_failed("Room leave", e).await,
        }
    }

    async fn room_message(&self, user: &str, room: &str, text: &str) -> Result<()> {
        if !is_valid_name(room) {
            return self.reply(&err_line("ROOM")).await;
        }
        let recipients = match self.ctx.rooms.is_member(room, self.handle.id()) {
            Ok(true) => self.ctx.rooms.recipients(room, self.handle.id()),
            Ok(false) => return self.reply(&err_line("ROOM")).await,
            Err(e) => Err(e),
        };
        let recipients = match recipients {
            Ok(recipients) => recipients,
            Err(e) => return self.storage_failed("Room lookup", e).await,
        };

        let frame = Frame::new(FrameType::RoomMsg, user, room, text);
        for member in recipients {
            let _ = member.push(&frame).await;
        }
        self.reply(OK_ROOM).await
    }

    async fn members(&self, room: &str) -> Result<()> {
        if !is_valid_name(room) {
            return self.reply(&err_line("ROOM")).await;
        }
        match self.ctx.rooms.members(room) {
            Ok(names) => {
                self.reply(&format!("MEMBERS {} {}", room, names.join(",")))
                    .await
            }
            Err(e) => self.storage_failed("Room members", e).await,
        }
    }

    async fn cleanup(&mut self) {
        let conn_id = self.handle.id();
        let rooms_left = self.ctx.rooms.leave_all(conn_id);

        if let Some(user) = self.user.take() {
            if self.ctx.presence.unregister(&user, conn_id) {
                let announcement = format!("[LEAVE] {}", user);
                for other in self.ctx.presence.others(conn_id) {
                    let _ = other.send_line(&announcement).await;
                }
            }
            info!(user = %user, conn = conn_id, rooms = rooms_left.len(), "User disconnected");
        }

        self.handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::storage::{Database, FileStore, MessageStore, RoomDirectory, UserDirectory};
    use tokio::io::AsyncWriteExt;

    /// Reports every name as unknown, as if another login registers it
    /// between the lookup and the insert.
    struct LateLookup(Database);

    impl UserDirectory for LateLookup {
        fn exists(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }

        fn register(&self, name: &str, password: Option<&str>) -> Result<bool> {
            self.0.register(name, password)
        }

        fn verify_credentials(&self, name: &str, password: Option<&str>) -> Result<bool> {
            self.0.verify_credentials(name, password)
        }
    }

    fn context(db: &Database) -> Arc<ServerContext> {
        Arc::new(ServerContext::with_database(
            ServerConfig::default(),
            db.clone(),
        ))
    }

    /// Feed `script` to a fresh actor and collect every line it writes back.
    async fn converse(ctx: Arc<ServerContext>, script: &str) -> Vec<String> {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(server);
        let handle = ConnectionHandle::new(write_half, None);
        let actor = tokio::spawn(ConnectionActor::new(ctx, read_half, handle).run());

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(script.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(line);
        }
        actor.await.unwrap().unwrap();
        replies
    }

    #[tokio::test]
    async fn test_dm_to_vanished_peer_is_queued() {
        let db = Database::open_in_memory().unwrap();
        let ctx = context(&db);

        // bob is still registered but the socket behind it is gone.
        let (gone, bob_writer) = tokio::io::duplex(64);
        drop(gone);
        let bob = ConnectionHandle::new(bob_writer, None);
        assert!(ctx.presence.try_register("bob", bob));

        let replies = converse(Arc::clone(&ctx), "LOGIN alice\nDM bob hi\nQUIT\n").await;
        assert_eq!(replies, vec!["OK LOGIN alice", "OK QUEUED", "BYE"]);

        let queued = db.load_queued("bob").unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].frame.sender, "alice");
        assert_eq!(queued[0].frame.body, "hi");
    }

    #[tokio::test]
    async fn test_losing_registration_still_checks_password() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.register("erin", Some("secret")).unwrap());

        let shared = Arc::new(db.clone());
        let ctx = Arc::new(ServerContext::new(
            ServerConfig::default(),
            Arc::clone(&shared) as Arc<dyn MessageStore>,
            Arc::clone(&shared) as Arc<dyn FileStore>,
            Arc::new(LateLookup(db.clone())),
            shared as Arc<dyn RoomDirectory>,
        ));

        let replies = converse(
            Arc::clone(&ctx),
            "LOGIN erin wrong\nLOGIN erin\nLOGIN erin secret\nQUIT\n",
        )
        .await;
        assert_eq!(replies, vec!["ERR LOGIN", "ERR LOGIN", "OK LOGIN erin", "BYE"]);
        assert!(db.verify_credentials("erin", Some("secret")).unwrap());
    }

    #[tokio::test]
    async fn test_commands_before_login_rejected() {
        let db = Database::open_in_memory().unwrap();
        let replies = converse(context(&db), "WHO\nDM bob hi\nQUIT\n").await;
        assert_eq!(replies, vec!["ERR NOT_LOGGED_IN", "ERR NOT_LOGGED_IN", "BYE"]);
    }
}
