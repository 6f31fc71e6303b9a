use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use mts::graph::{ApiError, AttachmentSource, RemoteAttachment, RemoteMessage};
use mts::images::{ImageUploader, UploadError};
use mts::store::Store;
use mts::sync::{group_by_conversation, CancelFlag, Reconciler, SyncStats};

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("mts-reconcile-it-{}.db", Uuid::new_v4()))
}

fn remote_message(
    id: &str,
    conversation_id: &str,
    sent_at: &str,
    from: &str,
    subject: &str,
    body_html: &str,
) -> RemoteMessage {
    serde_json::from_value(json!({
        "id": id,
        "conversationId": conversation_id,
        "sentDateTime": sent_at,
        "from": { "emailAddress": { "address": from } },
        "toRecipients": [{ "emailAddress": { "address": "owner@example.com" } }],
        "subject": subject,
        "bodyPreview": "preview",
        "body": { "contentType": "html", "content": body_html },
        "internetMessageId": format!("<{id}@example.com>")
    }))
    .expect("deserialize remote message")
}

#[derive(Default)]
struct StubAttachments {
    by_message: HashMap<String, Vec<RemoteAttachment>>,
}

impl StubAttachments {
    fn with(mut self, message_id: &str, attachments: Vec<RemoteAttachment>) -> Self {
        self.by_message.insert(message_id.to_string(), attachments);
        self
    }
}

#[async_trait(?Send)]
impl AttachmentSource for StubAttachments {
    async fn attachments_for(&self, message_id: &str) -> Result<Vec<RemoteAttachment>, ApiError> {
        Ok(self.by_message.get(message_id).cloned().unwrap_or_default())
    }
}

struct FixedUrlUploader(&'static str);

#[async_trait(?Send)]
impl ImageUploader for FixedUrlUploader {
    async fn upload(&self, _: &str, _: &str, _: &str) -> Result<String, UploadError> {
        Ok(self.0.to_string())
    }
}

struct FailingUploader;

#[async_trait(?Send)]
impl ImageUploader for FailingUploader {
    async fn upload(&self, _: &str, _: &str, _: &str) -> Result<String, UploadError> {
        Err(UploadError::Status { status: 500 })
    }
}

async fn reconcile_once(
    store: &Store,
    attachments: &StubAttachments,
    uploader: &dyn ImageUploader,
    messages: Vec<RemoteMessage>,
) -> SyncStats {
    let grouped = group_by_conversation(messages);
    let reconciler = Reconciler::new(store, attachments, uploader, CancelFlag::new());
    reconciler.reconcile(&grouped).await
}

fn plain_conversation() -> Vec<RemoteMessage> {
    vec![
        remote_message(
            "m1",
            "C1",
            "2026-01-01T09:00:00Z",
            "alex@example.com",
            "Kickoff",
            "<p>first message</p>",
        ),
        remote_message(
            "m2",
            "C1",
            "2026-01-02T09:00:00Z",
            "owner@example.com",
            "Re: Kickoff",
            "<p>second message</p>",
        ),
    ]
}

#[tokio::test]
async fn first_run_creates_everything_second_run_is_a_noop() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");
    let attachments = StubAttachments::default();

    let first = reconcile_once(&store, &attachments, &FailingUploader, plain_conversation()).await;
    assert_eq!(first.threads_created, 1);
    assert_eq!(first.threads_updated, 0);
    assert_eq!(first.messages_created, 2);
    assert_eq!(first.messages_updated, 0);
    assert_eq!(first.failed, 0);

    let second = reconcile_once(&store, &attachments, &FailingUploader, plain_conversation()).await;
    assert_eq!(second.messages_created, 0, "idempotent re-run must not insert");
    assert_eq!(second.messages_updated, 0, "idempotent re-run must not update");
    assert_eq!(second.threads_created, 0);
    assert_eq!(second.threads_updated, 1, "thread aggregates are refreshed");

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn changed_body_updates_exactly_that_message() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");
    let attachments = StubAttachments::default();

    reconcile_once(&store, &attachments, &FailingUploader, plain_conversation()).await;

    let mut changed = plain_conversation();
    changed[1] = remote_message(
        "m2",
        "C1",
        "2026-01-02T09:00:00Z",
        "owner@example.com",
        "Re: Kickoff",
        "<p>second message, edited</p>",
    );
    let stats = reconcile_once(&store, &attachments, &FailingUploader, changed).await;
    assert_eq!(stats.messages_updated, 1);
    assert_eq!(stats.messages_created, 0);

    let stored = store
        .get_message("m2")
        .expect("get message")
        .expect("message exists");
    assert!(stored.html_clean.contains("edited"));

    let untouched = store
        .get_message("m1")
        .expect("get message")
        .expect("message exists");
    assert!(untouched.html_clean.contains("first message"));

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn thread_message_count_matches_stored_documents() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");
    let attachments = StubAttachments::default();

    reconcile_once(&store, &attachments, &FailingUploader, plain_conversation()).await;

    let thread = store
        .get_thread("C1")
        .expect("get thread")
        .expect("thread exists");
    let stored_count = store
        .count_messages_for_thread("C1")
        .expect("count messages");
    assert_eq!(thread.message_count, stored_count);
    assert_eq!(stored_count, 2);

    assert_eq!(thread.subject, "Kickoff");
    assert_eq!(thread.first_at, "2026-01-01T09:00:00+00:00");
    assert_eq!(thread.updated_at, "2026-01-02T09:00:00+00:00");
    let addresses: Vec<&str> = thread
        .participants
        .iter()
        .map(|p| p.address.as_str())
        .collect();
    assert_eq!(addresses, vec!["alex@example.com", "owner@example.com"]);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn inline_image_is_uploaded_and_inlined() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");

    let message = remote_message(
        "m-img",
        "C2",
        "2026-01-01T09:00:00Z",
        "alex@example.com",
        "Chart attached",
        r#"<p>see chart</p><img alt="chart" src="cid:abc123">"#,
    );
    let attachment: RemoteAttachment = serde_json::from_value(json!({
        "id": "att-1",
        "contentType": "image/png",
        "isInline": true,
        "contentId": "<abc123>",
        "contentBytes": "iVBORw0KGgo="
    }))
    .expect("deserialize attachment");
    let attachments = StubAttachments::default().with("m-img", vec![attachment]);
    let uploader = FixedUrlUploader("https://img.example/x.png");

    let stats = reconcile_once(&store, &attachments, &uploader, vec![message.clone()]).await;
    assert_eq!(stats.images_processed, 1);
    assert_eq!(stats.messages_created, 1);

    let stored = store
        .get_message("m-img")
        .expect("get message")
        .expect("message exists");
    assert!(stored.html.contains(r#"src="https://img.example/x.png""#));
    assert!(!stored.html.contains("cid:"));
    assert!(stored.html_raw.contains("cid:abc123"), "raw body stays untouched");

    // The uploader is deterministic here, so a re-run resolves to the same
    // clean body and skips the write.
    let second = reconcile_once(&store, &attachments, &uploader, vec![message]).await;
    assert_eq!(second.messages_updated, 0);
    assert_eq!(second.messages_created, 0);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn failed_upload_persists_placeholder() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");

    let message = remote_message(
        "m-img",
        "C2",
        "2026-01-01T09:00:00Z",
        "alex@example.com",
        "Chart attached",
        r#"<img alt="chart" src="cid:abc123">"#,
    );
    let attachment: RemoteAttachment = serde_json::from_value(json!({
        "id": "att-1",
        "contentType": "image/png",
        "isInline": true,
        "contentId": "abc123",
        "contentBytes": "iVBORw0KGgo="
    }))
    .expect("deserialize attachment");
    let attachments = StubAttachments::default().with("m-img", vec![attachment]);

    let stats = reconcile_once(&store, &attachments, &FailingUploader, vec![message]).await;
    assert_eq!(stats.images_processed, 0);
    assert_eq!(stats.messages_created, 1, "upload failure is local to the image");

    let stored = store
        .get_message("m-img")
        .expect("get message")
        .expect("message exists");
    assert!(stored.html.contains(r#"data-cid="abc123""#));
    assert!(stored.html.contains("mail-cid-placeholder"));
    assert!(!stored.html.contains("src=\"cid:"));

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn quoted_history_is_split_and_folded() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");
    let attachments = StubAttachments::default();

    let message = remote_message(
        "m-q",
        "C3",
        "2026-01-01T09:00:00Z",
        "alex@example.com",
        "Re: status",
        "<p>latest reply</p><blockquote>earlier message</blockquote>",
    );
    reconcile_once(&store, &attachments, &FailingUploader, vec![message]).await;

    let stored = store
        .get_message("m-q")
        .expect("get message")
        .expect("message exists");
    assert!(stored.has_quoted);
    assert_eq!(stored.quoted_html, "<blockquote>earlier message</blockquote>");
    assert_eq!(stored.html_clean, "<p>latest reply</p>");

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_conversation() {
    let path = temp_db_path();
    let store = Store::open(&path).expect("open store");
    let attachments = StubAttachments::default();

    let cancel = CancelFlag::new();
    cancel.cancel();

    let grouped = group_by_conversation(plain_conversation());
    let reconciler = Reconciler::new(&store, &attachments, &FailingUploader, cancel);
    let stats = reconciler.reconcile(&grouped).await;

    assert_eq!(stats, SyncStats::default());
    assert!(store.get_thread("C1").expect("get thread").is_none());

    let _ = std::fs::remove_file(path);
}
