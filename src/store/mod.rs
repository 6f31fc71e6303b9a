//! SQLite-backed document store for threads and messages.
//!
//! The connection is constructed explicitly by the caller and passed into
//! the reconciler; there is no process-wide cached handle. Array- and
//! object-valued fields are persisted as JSON text columns.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;

use self::models::{MailMessage, SyncState, Thread};

pub mod migrations;
pub mod models;
pub mod schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_threads: i64,
    pub total_messages: i64,
}

pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let store = Self {
            conn,
            path: path.to_path_buf(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::migrate(&self.conn)
            .map_err(|e| StoreError::Config(format!("migration failed: {e}")))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<Thread>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, subject, participants, first_at, updated_at, message_count, last_sync_at
            FROM threads
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Thread::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    /// Full overwrite: thread documents carry only derived aggregates, so
    /// there is no partial-field merge.
    pub fn put_thread(&self, thread: &Thread) -> Result<(), StoreError> {
        let participants = serde_json::to_string(&thread.participants)?;

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO threads (
                id, subject, participants, first_at, updated_at, message_count, last_sync_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                thread.id,
                thread.subject,
                participants,
                thread.first_at,
                thread.updated_at,
                thread.message_count,
                thread.last_sync_at,
            ],
        )?;

        Ok(())
    }

    pub fn list_threads(&self, limit: usize) -> Result<Vec<Thread>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, subject, participants, first_at, updated_at, message_count, last_sync_at
            FROM threads
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )?;

        let threads = stmt
            .query_map([limit as i64], Thread::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(threads)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MailMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, message_id, in_reply_to_id, reference_ids, thread_id, from_addr,
                   to_addrs, cc_addrs, sent_at, subject, body_preview, html_raw, html,
                   html_clean, quoted_html, has_quoted, attachments, content_hash, flagged
            FROM messages
            WHERE id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(MailMessage::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn put_message(&self, message: &MailMessage) -> Result<(), StoreError> {
        let reference_ids = serde_json::to_string(&message.reference_ids)?;
        let from_addr = message.from.as_ref().map(serde_json::to_string).transpose()?;
        let to_addrs = serde_json::to_string(&message.to)?;
        let cc_addrs = serde_json::to_string(&message.cc)?;
        let attachments = serde_json::to_string(&message.attachments)?;

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO messages (
                id, message_id, in_reply_to_id, reference_ids, thread_id, from_addr,
                to_addrs, cc_addrs, sent_at, subject, body_preview, html_raw, html,
                html_clean, quoted_html, has_quoted, attachments, content_hash, flagged
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                message.id,
                message.message_id,
                message.in_reply_to_id,
                reference_ids,
                message.thread_id,
                from_addr,
                to_addrs,
                cc_addrs,
                message.sent_at,
                message.subject,
                message.body_preview,
                message.html_raw,
                message.html,
                message.html_clean,
                message.quoted_html,
                message.has_quoted,
                attachments,
                message.content_hash,
                message.flagged,
            ],
        )?;

        Ok(())
    }

    pub fn get_messages_by_thread(&self, thread_id: &str) -> Result<Vec<MailMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, message_id, in_reply_to_id, reference_ids, thread_id, from_addr,
                   to_addrs, cc_addrs, sent_at, subject, body_preview, html_raw, html,
                   html_clean, quoted_html, has_quoted, attachments, content_hash, flagged
            FROM messages
            WHERE thread_id = ?
            ORDER BY sent_at ASC
            "#,
        )?;

        let messages = stmt
            .query_map([thread_id], MailMessage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn count_messages_for_thread(&self, thread_id: &str) -> Result<i64, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE thread_id = ?",
            [thread_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn clear_sync_state(&self, key: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?", [key])?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let total_threads: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
        let total_messages: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;

        Ok(StoreStats {
            total_threads,
            total_messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::models::{EmailAddress, MailMessage, Thread};
    use super::Store;

    fn temp_db_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mts-store-test-{}.db", Uuid::new_v4()));
        path
    }

    fn sample_thread() -> Thread {
        Thread {
            id: "conv-1".to_string(),
            subject: "Kickoff".to_string(),
            participants: vec![EmailAddress {
                name: Some("Sender".to_string()),
                address: "sender@example.com".to_string(),
            }],
            first_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-02T00:00:00+00:00".to_string(),
            message_count: 1,
            last_sync_at: "2026-01-03T00:00:00+00:00".to_string(),
        }
    }

    fn sample_message(id: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            message_id: "abc123".to_string(),
            in_reply_to_id: None,
            reference_ids: vec![],
            thread_id: "conv-1".to_string(),
            from: Some(EmailAddress {
                name: None,
                address: "sender@example.com".to_string(),
            }),
            to: vec![EmailAddress {
                name: None,
                address: "owner@example.com".to_string(),
            }],
            cc: vec![],
            sent_at: "2026-01-01T00:00:00+00:00".to_string(),
            subject: "Kickoff".to_string(),
            body_preview: "Hello".to_string(),
            html_raw: "<p>Hello</p>".to_string(),
            html: "<p>Hello</p>".to_string(),
            html_clean: "<p>Hello</p>".to_string(),
            quoted_html: String::new(),
            has_quoted: false,
            attachments: vec![],
            content_hash: "deadbeef".to_string(),
            flagged: false,
        }
    }

    #[test]
    fn thread_and_message_roundtrip() {
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        store.put_thread(&sample_thread()).expect("put thread");
        store.put_message(&sample_message("msg-1")).expect("put message");

        let thread = store
            .get_thread("conv-1")
            .expect("get thread")
            .expect("thread exists");
        assert_eq!(thread.subject, "Kickoff");
        assert_eq!(thread.participants.len(), 1);

        let message = store
            .get_message("msg-1")
            .expect("get message")
            .expect("message exists");
        assert_eq!(message.thread_id, "conv-1");
        assert_eq!(message.content_hash, "deadbeef");
        assert_eq!(message.from.as_ref().map(|a| a.address.as_str()), Some("sender@example.com"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn put_thread_overwrites_existing_document() {
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        store.put_thread(&sample_thread()).expect("put thread");
        let mut updated = sample_thread();
        updated.subject = "Kickoff (rescheduled)".to_string();
        updated.message_count = 3;
        store.put_thread(&updated).expect("overwrite thread");

        let loaded = store
            .get_thread("conv-1")
            .expect("get thread")
            .expect("thread exists");
        assert_eq!(loaded.subject, "Kickoff (rescheduled)");
        assert_eq!(loaded.message_count, 3);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn messages_by_thread_are_sorted_and_counted() {
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        let mut late = sample_message("msg-late");
        late.sent_at = "2026-01-05T00:00:00+00:00".to_string();
        let mut early = sample_message("msg-early");
        early.sent_at = "2026-01-01T00:00:00+00:00".to_string();

        store.put_message(&late).expect("put late");
        store.put_message(&early).expect("put early");

        let messages = store
            .get_messages_by_thread("conv-1")
            .expect("list messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "msg-early");
        assert_eq!(messages[1].id, "msg-late");

        assert_eq!(
            store
                .count_messages_for_thread("conv-1")
                .expect("count messages"),
            2
        );

        let stats = store.get_stats().expect("store stats");
        assert_eq!(stats.total_messages, 2);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sync_state_roundtrip() {
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        store
            .set_sync_state("graph_token", "{\"access_token\":\"abc\"}")
            .expect("set sync state");
        let state = store
            .get_sync_state("graph_token")
            .expect("get sync state")
            .expect("state exists");
        assert_eq!(state.value.as_deref(), Some("{\"access_token\":\"abc\"}"));

        store.clear_sync_state("graph_token").expect("clear state");
        assert!(store
            .get_sync_state("graph_token")
            .expect("get sync state")
            .is_none());

        let _ = std::fs::remove_file(path);
    }
}
