//! Deterministic HTML body pipeline.
//!
//! Ordered passes: tracking-pixel strip, blockquote extraction, marker
//! split, quote folding, `cid:` image resolution. Rewriting is regex-based;
//! a DOM parser would produce different output for malformed input, so the
//! regex semantics (case-insensitive, non-greedy blockquotes) are part of
//! the contract. Deeply nested `<blockquote>` structures may not round-trip
//! exactly. Known limitation.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use tracing::{debug, warn};

use crate::graph::RemoteAttachment;
use crate::images::{ImageUploader, UPLOAD_FOLDER};

/// Result of the full pipeline for one message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedBody {
    /// The untouched input.
    pub html_raw: String,
    /// Body after all passes; what the UI renders.
    pub html_clean: String,
    /// Accumulated quoted history (blockquotes + marker tail).
    pub quoted_html: String,
    pub has_quoted: bool,
    /// Successful cid-to-URL resolutions in this body.
    pub images_processed: usize,
}

fn img_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<img[^>]*>").expect("compile img tag regex"))
}

fn width_one_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bwidth\s*=\s*(?:"1"|'1'|1[\s/>])"#).expect("compile width regex")
    })
}

fn height_one_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bheight\s*=\s*(?:"1"|'1'|1[\s/>])"#).expect("compile height regex")
    })
}

fn blockquote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<blockquote.*?</blockquote>").expect("compile blockquote regex"))
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(发件人|From)\s*:|在\s*\d{4}年?\d{1,2}月?\d{1,2}日.*写道|-----Original Message-----|原始邮件|On .* wrote:",
        )
        .expect("compile quote marker regex")
    })
}

fn cid_img_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<img([^>]+)src=["']cid:([^"']+)["']([^>]*)>"#)
            .expect("compile cid img regex")
    })
}

/// Pass 1: drop `<img>` tags whose width and height are both literally 1,
/// in either attribute order, quoted or not.
pub fn strip_tracking_pixels(html: &str) -> String {
    img_tag_re()
        .replace_all(html, |caps: &regex::Captures<'_>| {
            let tag = &caps[0];
            if width_one_re().is_match(tag) && height_one_re().is_match(tag) {
                String::new()
            } else {
                tag.to_string()
            }
        })
        .into_owned()
}

/// Pass 2: pull every `<blockquote>…</blockquote>` fragment (non-greedy,
/// case-insensitive) out of the body. Returns `(quoted, remainder)`.
pub fn extract_blockquotes(html: &str) -> (String, String) {
    let quoted: String = blockquote_re()
        .find_iter(html)
        .map(|m| m.as_str())
        .collect();
    if quoted.is_empty() {
        return (quoted, html.to_string());
    }
    let remainder = blockquote_re().replace_all(html, "").into_owned();
    (quoted, remainder)
}

/// Pass 3: split at the first reply/forward marker. Everything from the
/// marker onward is quoted history.
pub fn split_by_markers(html: &str) -> (String, String) {
    match marker_re().find(html) {
        Some(found) => {
            let (clean, quoted) = html.split_at(found.start());
            (clean.to_string(), quoted.to_string())
        }
        None => (html.to_string(), String::new()),
    }
}

/// Pass 4: wrap any blockquote still embedded in the clean body so the
/// renderer can collapse it.
pub fn fold_quotes(html: &str) -> String {
    blockquote_re()
        .replace_all(html, |caps: &regex::Captures<'_>| {
            format!("<details><summary>展开历史</summary>{}</details>", &caps[0])
        })
        .into_owned()
}

/// Content ids arrive both bare and wrapped: `<abc@mailer>` vs `abc@mailer`.
fn normalize_content_id(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('<').unwrap_or(trimmed);
    trimmed.strip_suffix('>').unwrap_or(trimmed)
}

fn placeholder_tag(cid: &str, pre: &str, post: &str) -> String {
    format!(
        r#"<img data-cid="{cid}" alt="[内联图片]" class="mail-cid-placeholder"{pre}{post}>"#
    )
}

/// Pass 5: resolve `src="cid:…"` images against the message's inline
/// attachments. Successful uploads swap in the durable URL, preserving the
/// tag's other attributes; anything unresolved becomes a placeholder the
/// UI can recognize. Returns the rewritten body and the number of
/// successful resolutions.
pub async fn resolve_cid_images(
    html: &str,
    attachments: &[RemoteAttachment],
    message_id: &str,
    uploader: &dyn ImageUploader,
) -> (String, usize) {
    let references: Vec<(String, String, String, String)> = cid_img_re()
        .captures_iter(html)
        .map(|caps| {
            (
                caps[0].to_string(),
                caps[1].to_string(),
                caps[2].to_string(),
                caps[3].to_string(),
            )
        })
        .collect();
    if references.is_empty() {
        return (html.to_string(), 0);
    }

    let inline_by_cid: HashMap<&str, &RemoteAttachment> = attachments
        .iter()
        .filter(|att| att.is_inline.unwrap_or(false))
        .filter_map(|att| {
            att.content_id
                .as_deref()
                .map(|cid| (normalize_content_id(cid), att))
        })
        .collect();

    let mut rewritten = html.to_string();
    let mut processed = 0usize;
    let mut upload_index = 0usize;

    for (full, pre, cid, post) in references {
        let clean_cid = normalize_content_id(&cid);

        let replacement = match inline_by_cid.get(clean_cid) {
            Some(attachment) => {
                match upload_inline_attachment(attachment, message_id, upload_index, uploader).await
                {
                    Some(url) => {
                        upload_index += 1;
                        processed += 1;
                        debug!(cid = clean_cid, %url, "resolved inline image");
                        format!(r#"<img{pre} src="{url}"{post}>"#)
                    }
                    None => {
                        upload_index += 1;
                        warn!(cid = clean_cid, "inline image upload failed, using placeholder");
                        placeholder_tag(clean_cid, &pre, &post)
                    }
                }
            }
            None => {
                warn!(cid = clean_cid, "no inline attachment for cid, using placeholder");
                placeholder_tag(clean_cid, &pre, &post)
            }
        };

        rewritten = rewritten.replacen(&full, &replacement, 1);
    }

    (rewritten, processed)
}

async fn upload_inline_attachment(
    attachment: &RemoteAttachment,
    message_id: &str,
    index: usize,
    uploader: &dyn ImageUploader,
) -> Option<String> {
    let bytes = attachment.content_bytes.as_deref()?;
    if STANDARD.decode(bytes).is_err() {
        warn!("inline attachment carries invalid base64 content");
        return None;
    }

    let content_type = attachment.content_type.as_deref().unwrap_or("image/png");
    let data_url = format!("data:{content_type};base64,{bytes}");
    let public_id = format!("{message_id}_{index}_{}", chrono::Utc::now().timestamp());

    uploader
        .upload(&data_url, UPLOAD_FOLDER, &public_id)
        .await
        .ok()
}

/// Run the full pipeline over one raw HTML body.
pub async fn transform(
    raw_html: &str,
    attachments: &[RemoteAttachment],
    message_id: &str,
    uploader: &dyn ImageUploader,
) -> TransformedBody {
    let no_tracking = strip_tracking_pixels(raw_html);
    let (quoted_blocks, remainder) = extract_blockquotes(&no_tracking);
    let (clean_part, quoted_tail) = split_by_markers(&remainder);

    let quoted_html = format!("{quoted_blocks}{quoted_tail}");
    let folded = fold_quotes(&clean_part);
    let (html_clean, images_processed) =
        resolve_cid_images(&folded, attachments, message_id, uploader).await;

    TransformedBody {
        html_raw: raw_html.to_string(),
        html_clean,
        has_quoted: !quoted_html.is_empty(),
        quoted_html,
        images_processed,
    }
}
