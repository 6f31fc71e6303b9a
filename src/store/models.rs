use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// A mailbox participant as the Graph API reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

/// One persisted conversation thread. Identity is the provider-assigned
/// conversation id; aggregate fields are fully overwritten on every sync
/// that touches the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: String,
    pub subject: String,
    pub participants: Vec<EmailAddress>,
    pub first_at: String,
    pub updated_at: String,
    /// Always equals the number of message rows carrying this thread id.
    pub message_count: i64,
    pub last_sync_at: String,
}

/// One persisted mail message, keyed by the remote message's native id.
/// `message_id` is the derived SHA-1 identity that stays stable across
/// re-syncs; `content_hash` is a pure function of `html_clean` and gates
/// updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailMessage {
    pub id: String,
    pub message_id: String,
    pub in_reply_to_id: Option<String>,
    pub reference_ids: Vec<String>,
    pub thread_id: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub sent_at: String,
    pub subject: String,
    pub body_preview: String,
    pub html_raw: String,
    pub html: String,
    pub html_clean: String,
    pub quoted_html: String,
    pub has_quoted: bool,
    /// Persisted empty: inline images are rewritten into `html` instead.
    pub attachments: Vec<serde_json::Value>,
    pub content_hash: String,
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

fn parse_json_column<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_optional_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

impl Thread {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            subject: row.get("subject")?,
            participants: parse_json_column(row.get("participants")?),
            first_at: row.get("first_at")?,
            updated_at: row.get("updated_at")?,
            message_count: row.get("message_count")?,
            last_sync_at: row.get("last_sync_at")?,
        })
    }
}

impl MailMessage {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            in_reply_to_id: row.get("in_reply_to_id")?,
            reference_ids: parse_json_column(row.get("reference_ids")?),
            thread_id: row.get("thread_id")?,
            from: parse_optional_json(row.get("from_addr")?),
            to: parse_json_column(row.get("to_addrs")?),
            cc: parse_json_column(row.get("cc_addrs")?),
            sent_at: row.get("sent_at")?,
            subject: row.get("subject")?,
            body_preview: row.get("body_preview")?,
            html_raw: row.get("html_raw")?,
            html: row.get("html")?,
            html_clean: row.get("html_clean")?,
            quoted_html: row.get("quoted_html")?,
            has_quoted: row.get("has_quoted")?,
            attachments: parse_json_column(row.get("attachments")?),
            content_hash: row.get("content_hash")?,
            flagged: row.get("flagged")?,
        })
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{EmailAddress, MailMessage, Thread};

    #[test]
    fn serde_round_trip_models() {
        let thread = Thread {
            id: "conv-1".to_string(),
            subject: "Kickoff".to_string(),
            participants: vec![EmailAddress {
                name: Some("Sender".to_string()),
                address: "sender@example.com".to_string(),
            }],
            first_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-02T00:00:00+00:00".to_string(),
            message_count: 2,
            last_sync_at: "2026-01-03T00:00:00+00:00".to_string(),
        };

        let message = MailMessage {
            id: "msg-1".to_string(),
            message_id: "abc123".to_string(),
            in_reply_to_id: Some("<root@example.com>".to_string()),
            reference_ids: vec!["<root@example.com>".to_string()],
            thread_id: "conv-1".to_string(),
            from: Some(EmailAddress {
                name: None,
                address: "sender@example.com".to_string(),
            }),
            to: vec![],
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
        };

        let thread_json = serde_json::to_string(&thread).expect("serialize thread");
        let _: Thread = serde_json::from_str(&thread_json).expect("deserialize thread");

        let message_json = serde_json::to_string(&message).expect("serialize message");
        let _: MailMessage = serde_json::from_str(&message_json).expect("deserialize message");
    }
}
