use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            participants TEXT NOT NULL,
            first_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            last_sync_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            in_reply_to_id TEXT,
            reference_ids TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            from_addr TEXT,
            to_addrs TEXT NOT NULL,
            cc_addrs TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            subject TEXT NOT NULL,
            body_preview TEXT NOT NULL,
            html_raw TEXT NOT NULL,
            html TEXT NOT NULL,
            html_clean TEXT NOT NULL,
            quoted_html TEXT NOT NULL,
            has_quoted BOOLEAN NOT NULL,
            attachments TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            flagged BOOLEAN NOT NULL DEFAULT false
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);
        CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id);
        CREATE INDEX IF NOT EXISTS idx_threads_updated_at ON threads(updated_at);
        "#,
    )?;

    Ok(())
}
