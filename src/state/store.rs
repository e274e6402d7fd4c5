use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ChatError;
use crate::{Identity, IdentityOrigin, Message, Presence, UserId};

/// Durable message log plus the identity table, on SQLite. The store is the
/// sole writer of messages; `append` and `mark_read` commit before they
/// return, so callers may treat success as the delivery guarantee point.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChatError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, ChatError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), ChatError> {
        // seq breaks timestamp ties so conversation order is stable; id stays
        // the public, globally unique handle.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                read_flag INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(from_id, to_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                account_id TEXT,
                last_seen TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Append a message. Assigns id and server-side timestamp, persists
    /// durably, and returns the stored message with `read = false`.
    pub fn append(&self, from_id: &UserId, to_id: &UserId, content: &str) -> Result<Message, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            read: false,
        };

        self.conn.execute(
            "INSERT INTO messages (id, from_id, to_id, content, timestamp, read_flag)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![msg.id, msg.from_id, msg.to_id, msg.content, msg.timestamp],
        )?;

        Ok(msg)
    }

    /// All messages between a pair, oldest first. Unknown pairs are an empty
    /// conversation, never an error.
    pub fn list_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, ChatError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, from_id, to_id, content, timestamp, read_flag
             FROM messages
             WHERE (from_id = ?1 AND to_id = ?2) OR (from_id = ?2 AND to_id = ?1)
             ORDER BY timestamp ASC, seq ASC",
        )?;

        let messages = stmt
            .query_map(params![a, b], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    /// Flip a message's read flag, exactly once. Idempotent for the valid
    /// reader; `Forbidden` for anyone other than the recipient.
    pub fn mark_read(&self, message_id: &str, reader_id: &UserId) -> Result<Message, ChatError> {
        let found = self
            .conn
            .query_row(
                "SELECT id, from_id, to_id, content, timestamp, read_flag
                 FROM messages WHERE id = ?1",
                params![message_id],
                row_to_message,
            )
            .optional()?;

        let mut msg = found.ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if &msg.to_id != reader_id {
            return Err(ChatError::Forbidden);
        }

        if !msg.read {
            self.conn.execute(
                "UPDATE messages SET read_flag = 1 WHERE id = ?1",
                params![message_id],
            )?;
            msg.read = true;
        }
        Ok(msg)
    }

    /// Mark every unread message from `peer_id` to `reader_id` as read.
    /// Returns the affected message ids, oldest first, for receipt fan-out.
    pub fn mark_conversation_read(&self, reader_id: &UserId, peer_id: &UserId) -> Result<Vec<String>, ChatError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT id FROM messages
                 WHERE from_id = ?1 AND to_id = ?2 AND read_flag = 0
                 ORDER BY timestamp ASC, seq ASC",
            )?;
            let ids = stmt
                .query_map(params![peer_id, reader_id], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        if !ids.is_empty() {
            self.conn.execute(
                "UPDATE messages SET read_flag = 1
                 WHERE from_id = ?1 AND to_id = ?2 AND read_flag = 0",
                params![peer_id, reader_id],
            )?;
        }
        Ok(ids)
    }

    /// Unread message counts addressed to a user, grouped by sender.
    pub fn unread_counts(&self, user_id: &UserId) -> Result<HashMap<UserId, i64>, ChatError> {
        let mut stmt = self.conn.prepare(
            "SELECT from_id, COUNT(*) FROM messages
             WHERE to_id = ?1 AND read_flag = 0
             GROUP BY from_id",
        )?;

        let counts = stmt
            .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(counts)
    }

    /// Persist an identity so its id (and any stored conversations) stay
    /// addressable after a restart. Presence is not persisted.
    pub fn upsert_identity(&self, identity: &Identity) -> Result<(), ChatError> {
        let account_id = match &identity.origin {
            IdentityOrigin::AccountBound { account_id } => Some(account_id.as_str()),
            IdentityOrigin::Ephemeral => None,
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO identities (id, display_name, account_id, last_seen)
             VALUES (?1, ?2, ?3, ?4)",
            params![identity.id, identity.display_name, account_id, identity.last_seen],
        )?;
        Ok(())
    }

    pub fn load_identities(&self) -> Result<Vec<Identity>, ChatError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, account_id, last_seen FROM identities")?;

        let identities = stmt
            .query_map([], |row| {
                let account_id: Option<String> = row.get(2)?;
                let last_seen: DateTime<Utc> = row.get(3)?;
                Ok(Identity {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    origin: match account_id {
                        Some(account_id) => IdentityOrigin::AccountBound { account_id },
                        None => IdentityOrigin::Ephemeral,
                    },
                    status: Presence::Offline,
                    last_seen,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(identities)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        from_id: row.get(1)?,
        to_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        read: row.get(5)?,
    })
}
