//! Microsoft Graph mail fetcher.
//!
//! Two retrieval modes: a single filtered pass over the whole mailbox, or a
//! flagged-seed pass over Inbox/SentItems followed by per-conversation
//! expansion. Every list query follows the server's `@odata.nextLink`
//! cursor until exhausted; pagination within one query is strictly
//! sequential because each cursor comes from the previous page.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::debug;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,ccRecipients,receivedDateTime,sentDateTime,",
    "createdDateTime,conversationId,bodyPreview,body,flag,internetMessageId,",
    "internetMessageHeaders"
);
const PAGE_SIZE: usize = 50;

/// Folders consulted in flagged-seed mode.
const SEED_FOLDERS: &[&str] = &["Inbox", "SentItems"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("graph request failed: status={status} url={url}")]
    Status { status: u16, url: String },

    #[error("graph transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode graph response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },

    #[error("invalid graph url: {0}")]
    InvalidUrl(String),

    #[error("conversation expansion task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    #[serde(rename = "toRecipients")]
    pub to_recipients: Option<Vec<Recipient>>,
    #[serde(rename = "ccRecipients")]
    pub cc_recipients: Option<Vec<Recipient>>,
    #[serde(rename = "receivedDateTime")]
    pub received_date_time: Option<String>,
    #[serde(rename = "sentDateTime")]
    pub sent_date_time: Option<String>,
    #[serde(rename = "createdDateTime")]
    pub created_date_time: Option<String>,
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(rename = "bodyPreview")]
    pub body_preview: Option<String>,
    pub body: Option<MessageBody>,
    pub flag: Option<MessageFlag>,
    #[serde(rename = "internetMessageId")]
    pub internet_message_id: Option<String>,
    #[serde(rename = "internetMessageHeaders")]
    pub internet_message_headers: Option<Vec<InternetMessageHeader>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipient {
    #[serde(rename = "emailAddress")]
    pub email_address: Option<RecipientAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageFlag {
    #[serde(rename = "flagStatus")]
    pub flag_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternetMessageHeader {
    pub name: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteAttachment {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    pub size: Option<i64>,
    #[serde(rename = "isInline")]
    pub is_inline: Option<bool>,
    #[serde(rename = "contentId")]
    pub content_id: Option<String>,
    #[serde(rename = "contentBytes")]
    pub content_bytes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesPage {
    value: Vec<RemoteMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AttachmentsEnvelope {
    value: Vec<RemoteAttachment>,
}

impl Recipient {
    pub fn address(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.email_address
            .as_ref()
            .and_then(|email| email.name.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

impl RemoteMessage {
    /// Effective timestamp: sent, else received, else created, else epoch.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        [
            self.sent_date_time.as_deref(),
            self.received_date_time.as_deref(),
            self.created_date_time.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc))
        })
        .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn from_address(&self) -> Option<&str> {
        self.from.as_ref().and_then(Recipient::address)
    }

    pub fn to_list(&self) -> &[Recipient] {
        self.to_recipients.as_deref().unwrap_or_default()
    }

    pub fn cc_list(&self) -> &[Recipient] {
        self.cc_recipients.as_deref().unwrap_or_default()
    }

    pub fn is_flagged(&self) -> bool {
        self.flag
            .as_ref()
            .and_then(|flag| flag.flag_status.as_deref())
            .is_some_and(|status| status.eq_ignore_ascii_case("flagged"))
    }

    pub fn raw_html(&self) -> &str {
        self.body
            .as_ref()
            .and_then(|body| body.content.as_deref())
            .unwrap_or_default()
    }

    /// Case-insensitive lookup over the raw internet message headers.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.internet_message_headers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|header| {
                header
                    .name
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(name))
            })
            .and_then(|header| header.value.as_deref())
    }
}

pub fn matches_target(message: &RemoteMessage, target: Option<&str>) -> bool {
    let Some(target) = target else {
        return true;
    };
    let target = target.to_lowercase();

    if message
        .from_address()
        .is_some_and(|from| from.to_lowercase() == target)
    {
        return true;
    }

    message
        .to_list()
        .iter()
        .chain(message.cc_list().iter())
        .filter_map(Recipient::address)
        .any(|address| address.to_lowercase() == target)
}

pub fn sort_by_effective_timestamp(messages: &mut [RemoteMessage]) {
    messages.sort_by_key(RemoteMessage::effective_timestamp);
}

fn contact_filter(target: Option<&str>) -> String {
    match target {
        Some(email) => format!(
            " and (from/emailAddress/address eq '{email}' \
             or toRecipients/any(r:r/emailAddress/address eq '{email}') \
             or ccRecipients/any(r:r/emailAddress/address eq '{email}'))"
        ),
        None => String::new(),
    }
}

/// Seam for attachment retrieval so the reconciler can be driven without a
/// live Graph endpoint.
#[async_trait(?Send)]
pub trait AttachmentSource {
    async fn attachments_for(&self, message_id: &str) -> Result<Vec<RemoteAttachment>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    client: Client,
    base: String,
}

impl GraphClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base: base.into(),
        }
    }

    fn messages_url(&self, folder: Option<&str>, filter: &str) -> Result<Url, ApiError> {
        let endpoint = match folder {
            Some(folder) => format!("{}/me/mailFolders/{folder}/messages", self.base),
            None => format!("{}/me/messages", self.base),
        };
        let mut url = Url::parse(&endpoint).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_SELECT_FIELDS)
            .append_pair("$top", &PAGE_SIZE.to_string())
            .append_pair("$filter", filter);
        Ok(url)
    }

    async fn fetch_page(&self, token: &str, url: &str) -> Result<MessagesPage, ApiError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Follow the `@odata.nextLink` cursor until the server stops handing
    /// one back, concatenating all pages.
    async fn collect_all(&self, token: &str, first: Url) -> Result<Vec<RemoteMessage>, ApiError> {
        let mut messages = Vec::new();
        let mut next_url = first.to_string();
        let mut page_number = 0u64;

        loop {
            let page = self.fetch_page(token, &next_url).await?;
            page_number += 1;
            debug!(page = page_number, count = page.value.len(), "graph messages page");
            messages.extend(page.value);

            match page.next_link {
                Some(url) => next_url = url,
                None => break,
            }
        }

        Ok(messages)
    }

    async fn fetch_folder_messages(
        &self,
        token: &str,
        folder: &str,
        filter: &str,
    ) -> Result<Vec<RemoteMessage>, ApiError> {
        let url = self.messages_url(Some(folder), filter)?;
        self.collect_all(token, url).await
    }

    /// All Inbox/SentItems messages of one conversation matching the contact
    /// filter, deduplicated by message id.
    async fn fetch_conversation_messages(
        &self,
        token: &str,
        conversation_id: &str,
        target: Option<&str>,
    ) -> Result<Vec<RemoteMessage>, ApiError> {
        let filter = format!(
            "isDraft eq false and conversationId eq '{conversation_id}'{}",
            contact_filter(target)
        );

        let mut by_id: HashMap<String, RemoteMessage> = HashMap::new();
        for folder in SEED_FOLDERS {
            let batch = self.fetch_folder_messages(token, folder, &filter).await?;
            for message in batch {
                by_id.insert(message.id.clone(), message);
            }
        }

        Ok(by_id.into_values().collect())
    }

    /// Fetch the messages relevant to `target` in one of two modes.
    ///
    /// Full mode runs one filtered query across the whole mailbox.
    /// Flagged-seed mode queries Inbox and SentItems for flagged messages,
    /// then expands every seeded conversation to its full context; the
    /// expansions are independent read-only queries and run concurrently.
    /// The result is always sorted ascending by effective timestamp.
    pub async fn fetch_messages_for_contact(
        &self,
        token: &str,
        target: Option<&str>,
        flagged_only: bool,
    ) -> Result<Vec<RemoteMessage>, ApiError> {
        if !flagged_only {
            let filter = format!("isDraft eq false{}", contact_filter(target));
            let url = self.messages_url(None, &filter)?;
            let mut messages = self.collect_all(token, url).await?;
            messages.retain(|message| matches_target(message, target));
            sort_by_effective_timestamp(&mut messages);
            return Ok(messages);
        }

        let flagged_filter = format!(
            "isDraft eq false and flag/flagStatus eq 'flagged'{}",
            contact_filter(target)
        );

        let mut seeds = Vec::new();
        for folder in SEED_FOLDERS {
            seeds.extend(
                self.fetch_folder_messages(token, folder, &flagged_filter)
                    .await?,
            );
        }
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let conversation_ids: Vec<String> = seeds
            .iter()
            .filter_map(|message| message.conversation_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut expansions = JoinSet::new();
        for conversation_id in conversation_ids {
            let client = self.clone();
            let token = token.to_string();
            let target = target.map(str::to_string);
            expansions.spawn(async move {
                client
                    .fetch_conversation_messages(&token, &conversation_id, target.as_deref())
                    .await
            });
        }

        let mut by_id: HashMap<String, RemoteMessage> = HashMap::new();
        while let Some(joined) = expansions.join_next().await {
            let batch = joined.map_err(|e| ApiError::Task(e.to_string()))??;
            for message in batch {
                by_id.insert(message.id.clone(), message);
            }
        }

        let mut messages: Vec<RemoteMessage> = by_id
            .into_values()
            .filter(|message| matches_target(message, target))
            .collect();
        sort_by_effective_timestamp(&mut messages);
        Ok(messages)
    }

    /// Single non-paginated attachment listing for one message.
    pub async fn fetch_attachments(
        &self,
        token: &str,
        message_id: &str,
    ) -> Result<Vec<RemoteAttachment>, ApiError> {
        let url = format!("{}/me/messages/{message_id}/attachments", self.base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.text().await?;
        let envelope: AttachmentsEnvelope =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode { url, source })?;
        Ok(envelope.value)
    }
}

/// Pairs a client with a run's access token for the reconciler.
pub struct GraphAttachmentSource<'a> {
    client: &'a GraphClient,
    token: String,
}

impl<'a> GraphAttachmentSource<'a> {
    pub fn new(client: &'a GraphClient, token: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
        }
    }
}

#[async_trait(?Send)]
impl AttachmentSource for GraphAttachmentSource<'_> {
    async fn attachments_for(&self, message_id: &str) -> Result<Vec<RemoteAttachment>, ApiError> {
        self.client.fetch_attachments(&self.token, message_id).await
    }
}
