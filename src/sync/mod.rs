//! Conversation aggregation and the idempotent upsert engine.
//!
//! Conversations and the messages inside them are processed sequentially:
//! message order drives the thread's firstAt/updatedAt/participants
//! derivations, and sequential writes keep a thread's aggregates consistent
//! with its messages. Cancellation is cooperative and lands between
//! conversations, never mid-message.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::config::SyncConfig;
use crate::graph::{
    AttachmentSource, GraphAttachmentSource, GraphClient, Recipient, RemoteMessage,
};
use crate::hash::sha1_hex;
use crate::images::{CloudinaryUploader, DisabledUploader, ImageUploader};
use crate::store::models::{EmailAddress, MailMessage, Thread};
use crate::store::{Store, StoreError};
use crate::transform::{transform, TransformedBody};

/// Bucket for messages the provider returned without a conversation id.
pub const NO_CONVERSATION_KEY: &str = "no-conv";

/// Subject placeholder for conversations whose first message has none.
pub const DEFAULT_SUBJECT: &str = "(无标题)";

const PREVIEW_MAX_CHARS: usize = 240;

/// Aggregate counters for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub threads_created: usize,
    pub threads_updated: usize,
    pub messages_created: usize,
    pub messages_updated: usize,
    pub images_processed: usize,
    pub failed: usize,
}

/// Cooperative cancellation, checked between conversations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Group fetched messages by conversation id, each bucket sorted ascending
/// by effective timestamp. Pure, no I/O.
pub fn group_by_conversation(
    messages: Vec<RemoteMessage>,
) -> BTreeMap<String, Vec<RemoteMessage>> {
    let mut grouped: BTreeMap<String, Vec<RemoteMessage>> = BTreeMap::new();
    for message in messages {
        let key = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| NO_CONVERSATION_KEY.to_string());
        grouped.entry(key).or_default().push(message);
    }
    for bucket in grouped.values_mut() {
        bucket.sort_by_key(RemoteMessage::effective_timestamp);
    }
    grouped
}

/// Stable message identity across re-syncs: SHA-1 of the normalized native
/// id, the second-floored ISO-8601 timestamp, the sender address and the
/// subject. The `.000Z` millisecond rendering is part of the persisted
/// contract and must not change.
pub fn derive_message_id(
    native_id: &str,
    timestamp: DateTime<Utc>,
    from_address: &str,
    subject: &str,
) -> String {
    let base: String = native_id
        .chars()
        .filter(|c| !matches!(c, '<' | '>'))
        .collect::<String>()
        .trim()
        .to_string();
    let floored = timestamp.with_nanosecond(0).unwrap_or(timestamp);
    let iso = floored.format("%Y-%m-%dT%H:%M:%S%.3fZ");
    sha1_hex(&format!("{base}#{iso}#{from_address}#{subject}"))
}

/// Idempotency gate: a pure function of the cleaned body.
pub fn content_hash(html_clean: &str) -> String {
    sha1_hex(html_clean)
}

fn to_email_address(recipient: &Recipient) -> Option<EmailAddress> {
    recipient.address().map(|address| EmailAddress {
        name: recipient.name().map(str::to_string),
        address: address.to_string(),
    })
}

fn collect_participants(messages: &[RemoteMessage]) -> Vec<EmailAddress> {
    let mut seen = HashSet::new();
    let mut participants = Vec::new();
    for message in messages {
        let recipients = message
            .from
            .iter()
            .chain(message.to_list().iter())
            .chain(message.cc_list().iter());
        for recipient in recipients {
            if let Some(address) = to_email_address(recipient) {
                if seen.insert(address.address.to_lowercase()) {
                    participants.push(address);
                }
            }
        }
    }
    participants
}

fn derive_preview(body_preview: Option<&str>, html_clean: &str) -> String {
    if let Some(preview) = body_preview.map(str::trim).filter(|p| !p.is_empty()) {
        return preview.to_string();
    }

    let plain = std::panic::catch_unwind(|| {
        html2text::from_read(html_clean.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_default();
    plain.chars().take(PREVIEW_MAX_CHARS).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Created,
    Updated,
    Unchanged,
}

pub struct Reconciler<'a> {
    store: &'a Store,
    attachments: &'a dyn AttachmentSource,
    uploader: &'a dyn ImageUploader,
    cancel: CancelFlag,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a Store,
        attachments: &'a dyn AttachmentSource,
        uploader: &'a dyn ImageUploader,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            store,
            attachments,
            uploader,
            cancel,
        }
    }

    /// Upsert every conversation's thread and messages. Persistence errors
    /// are logged with their ids and counted; they never abort the batch —
    /// re-runs only rewrite what actually changed.
    pub async fn reconcile(
        &self,
        conversations: &BTreeMap<String, Vec<RemoteMessage>>,
    ) -> SyncStats {
        let mut stats = SyncStats::default();
        let now = Utc::now();

        for (conversation_id, messages) in conversations {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, stopping before next conversation");
                break;
            }
            if messages.is_empty() {
                continue;
            }

            let thread = build_thread(conversation_id, messages, now);
            match self.upsert_thread(&thread) {
                Ok(created) => {
                    if created {
                        stats.threads_created += 1;
                    } else {
                        stats.threads_updated += 1;
                    }
                }
                Err(error) => {
                    warn!(thread_id = %conversation_id, "thread upsert failed: {error}");
                    stats.failed += 1;
                    // Without the thread document the aggregate invariant
                    // cannot hold; skip its messages and let a re-run heal.
                    continue;
                }
            }

            for message in messages {
                match self
                    .process_message(conversation_id, &thread.subject, message)
                    .await
                {
                    Ok((outcome, images)) => {
                        stats.images_processed += images;
                        match outcome {
                            MessageOutcome::Created => stats.messages_created += 1,
                            MessageOutcome::Updated => stats.messages_updated += 1,
                            MessageOutcome::Unchanged => {}
                        }
                    }
                    Err(error) => {
                        warn!(
                            thread_id = %conversation_id,
                            message_id = %message.id,
                            "message upsert failed: {error}"
                        );
                        stats.failed += 1;
                    }
                }
            }
        }

        stats
    }

    fn upsert_thread(&self, thread: &Thread) -> Result<bool, StoreError> {
        let existed = self.store.get_thread(&thread.id)?.is_some();
        self.store.put_thread(thread)?;
        Ok(!existed)
    }

    async fn process_message(
        &self,
        thread_id: &str,
        thread_subject: &str,
        message: &RemoteMessage,
    ) -> Result<(MessageOutcome, usize), StoreError> {
        let raw_html = message.raw_html();

        // Attachment metadata is only worth a round-trip when the body
        // actually references an inline image.
        let attachments = if raw_html.contains("cid:") {
            match self.attachments.attachments_for(&message.id).await {
                Ok(list) => list,
                Err(error) => {
                    warn!(
                        message_id = %message.id,
                        "attachment listing failed, inline images become placeholders: {error}"
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let body = transform(raw_html, &attachments, &message.id, self.uploader).await;
        let hash = content_hash(&body.html_clean);

        let existing = self.store.get_message(&message.id)?;
        if existing
            .as_ref()
            .is_some_and(|stored| stored.content_hash == hash)
        {
            return Ok((MessageOutcome::Unchanged, body.images_processed));
        }

        let doc = build_message(thread_id, thread_subject, message, &body, hash);
        self.store.put_message(&doc)?;

        let outcome = if existing.is_some() {
            MessageOutcome::Updated
        } else {
            MessageOutcome::Created
        };
        Ok((outcome, body.images_processed))
    }
}

fn build_thread(conversation_id: &str, messages: &[RemoteMessage], now: DateTime<Utc>) -> Thread {
    let first = &messages[0];
    let last = &messages[messages.len() - 1];

    Thread {
        id: conversation_id.to_string(),
        subject: first
            .subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        participants: collect_participants(messages),
        first_at: first.effective_timestamp().to_rfc3339(),
        updated_at: last.effective_timestamp().to_rfc3339(),
        message_count: messages.len() as i64,
        last_sync_at: now.to_rfc3339(),
    }
}

fn build_message(
    thread_id: &str,
    thread_subject: &str,
    message: &RemoteMessage,
    body: &TransformedBody,
    hash: String,
) -> MailMessage {
    let native_id = message
        .internet_message_id
        .as_deref()
        .unwrap_or(&message.id);
    let timestamp = message.effective_timestamp();
    let from_address = message.from_address().unwrap_or_default();
    let subject_for_id = message.subject.as_deref().unwrap_or_default();
    let message_id = derive_message_id(native_id, timestamp, from_address, subject_for_id);

    let references: Vec<String> = message
        .header_value("references")
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    MailMessage {
        id: message.id.clone(),
        message_id,
        in_reply_to_id: message.header_value("in-reply-to").map(str::to_string),
        reference_ids: references,
        thread_id: thread_id.to_string(),
        from: message.from.as_ref().and_then(to_email_address),
        to: message
            .to_list()
            .iter()
            .filter_map(to_email_address)
            .collect(),
        cc: message
            .cc_list()
            .iter()
            .filter_map(to_email_address)
            .collect(),
        sent_at: timestamp.to_rfc3339(),
        subject: message
            .subject
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| thread_subject.to_string()),
        body_preview: derive_preview(message.body_preview.as_deref(), &body.html_clean),
        html_raw: body.html_raw.clone(),
        html: body.html_clean.clone(),
        html_clean: body.html_clean.clone(),
        quoted_html: body.quoted_html.clone(),
        has_quoted: body.has_quoted,
        attachments: Vec::new(),
        content_hash: hash,
        flagged: message.is_flagged(),
    }
}

/// One end-to-end sync: token, fetch, group, reconcile, summary.
pub async fn run_sync(config: &SyncConfig, cancel: CancelFlag) -> Result<SyncStats> {
    let store = Store::open(&config.db_path)
        .with_context(|| format!("open document store at {}", config.db_path.display()))?;

    let provider = TokenProvider::new(config);
    let token = provider
        .acquire(&store)
        .await
        .context("acquire mail API access token")?;

    let client = GraphClient::new(config.graph_api_base.clone());
    let messages = client
        .fetch_messages_for_contact(&token, config.target_email.as_deref(), config.flagged_only)
        .await
        .context("fetch mailbox messages")?;
    info!(count = messages.len(), flagged_only = config.flagged_only, "fetched messages");

    let grouped = group_by_conversation(messages);
    let conversation_count = grouped.len();

    let uploader: Box<dyn ImageUploader> = match config.cloudinary.as_ref() {
        Some(cloudinary) => Box::new(CloudinaryUploader::new(cloudinary)),
        None => {
            warn!("no image store configured; inline images will use placeholders");
            Box::new(DisabledUploader)
        }
    };
    let attachments = GraphAttachmentSource::new(&client, token);

    let reconciler = Reconciler::new(&store, &attachments, uploader.as_ref(), cancel);
    let stats = reconciler.reconcile(&grouped).await;

    info!(
        "mail sync done: {} conversations; +{}/{} threads, +{}/{} messages, {} images processed, {} failures",
        conversation_count,
        stats.threads_created,
        stats.threads_updated,
        stats.messages_created,
        stats.messages_updated,
        stats.images_processed,
        stats.failed,
    );

    Ok(stats)
}
