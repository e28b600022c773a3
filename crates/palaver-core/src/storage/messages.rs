//! Message persistence: live-delivered and queued direct messages.

use super::database::{now, Database};
use super::{HistoryRow, MessageKind, MessageStatus, MessageStore, QueuedMessage};
use crate::error::Result;
use crate::protocol::{Frame, FrameType};
use rusqlite::params;

impl MessageStore for Database {
    fn save_message(
        &self,
        kind: MessageKind,
        sender: &str,
        recipient: &str,
        body: &str,
        delivered: bool,
    ) -> Result<i64> {
        let ts = now();
        let (status, delivered_at) = if delivered {
            (MessageStatus::Delivered, Some(ts))
        } else {
            (MessageStatus::Queued, None)
        };

        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO messages (kind, sender, recipient, body, status, created_at, delivered_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![
                kind as i32,
                sender,
                recipient,
                body,
                status as i32,
                ts,
                delivered_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save_queued(&self, frame: &Frame) -> Result<i64> {
        self.save_message(
            MessageKind::Text,
            &frame.sender,
            &frame.recipient,
            &frame.body,
            false,
        )
    }

    fn load_queued(&self, recipient: &str) -> Result<Vec<QueuedMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, sender, recipient, body, created_at
               FROM messages
               WHERE recipient = ? AND status = ? AND kind = ?
               ORDER BY id ASC"#,
        )?;

        let rows = stmt
            .query_map(
                params![recipient, MessageStatus::Queued as i32, MessageKind::Text as i32],
                |row| {
                    let sender: String = row.get(1)?;
                    let recipient: String = row.get(2)?;
                    let body: String = row.get(3)?;
                    Ok(QueuedMessage {
                        id: row.get(0)?,
                        frame: Frame::new(FrameType::Dm, sender, recipient, body),
                        queued_at: row.get(4)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn mark_delivered(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET status = ?, delivered_at = ? WHERE id = ?",
            params![MessageStatus::Delivered as i32, now(), id],
        )?;
        Ok(())
    }

    fn load_conversation(&self, a: &str, b: &str, limit: usize) -> Result<Vec<HistoryRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, kind, sender, recipient, body, status, created_at
               FROM messages
               WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
               ORDER BY id DESC
               LIMIT ?3"#,
        )?;

        let mut rows = stmt
            .query_map(params![a, b, limit as i64], |row| {
                Ok(HistoryRow {
                    id: row.get(0)?,
                    kind: MessageKind::from(row.get::<_, i32>(1)?),
                    sender: row.get(2)?,
                    recipient: row.get(3)?,
                    body: row.get(4)?,
                    status: MessageStatus::from(row.get::<_, i32>(5)?),
                    timestamp: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.reverse();
        Ok(rows)
    }
}
