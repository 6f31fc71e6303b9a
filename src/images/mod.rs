//! Durable storage for inline images.
//!
//! One upload per resolved `cid:` reference. Failures are local to the
//! image: the caller substitutes a placeholder and moves on.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::CloudinaryConfig;
use crate::hash::sha1_hex;

/// Target folder for all inline mail images.
pub const UPLOAD_FOLDER: &str = "mail-images";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("image upload transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image upload rejected: status={status}")]
    Status { status: u16 },

    #[error("decode upload response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("image uploads are not configured")]
    NotConfigured,
}

#[async_trait(?Send)]
pub trait ImageUploader {
    /// Upload one image (as a base64 data URL) and return its durable URL.
    async fn upload(
        &self,
        data_url: &str,
        folder: &str,
        public_id: &str,
    ) -> Result<String, UploadError>;
}

#[derive(Debug, Clone, serde::Deserialize)]
struct UploadResponse {
    secure_url: String,
}

pub struct CloudinaryUploader {
    client: reqwest::Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
}

impl CloudinaryUploader {
    pub fn new(config: &CloudinaryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cloud_name: config.cloud_name.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        }
    }

    fn upload_url(&self) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/image/upload",
            self.cloud_name
        )
    }

    /// Cloudinary request signature: SHA-1 over the alphabetically ordered
    /// signed parameters with the API secret appended. `file` and `api_key`
    /// are excluded from signing.
    fn signature(&self, folder: &str, public_id: &str, timestamp: i64) -> String {
        sha1_hex(&format!(
            "{}{}",
            signature_payload(folder, public_id, timestamp),
            self.api_secret
        ))
    }
}

fn signature_payload(folder: &str, public_id: &str, timestamp: i64) -> String {
    format!("folder={folder}&overwrite=false&public_id={public_id}&timestamp={timestamp}")
}

#[async_trait(?Send)]
impl ImageUploader for CloudinaryUploader {
    async fn upload(
        &self,
        data_url: &str,
        folder: &str,
        public_id: &str,
    ) -> Result<String, UploadError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.signature(folder, public_id, timestamp);

        let response = self
            .client
            .post(self.upload_url())
            .form(&[
                ("file", data_url),
                ("folder", folder),
                ("public_id", public_id),
                ("overwrite", "false"),
                ("timestamp", &timestamp.to_string()),
                ("api_key", &self.api_key),
                ("signature", &signature),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let payload: UploadResponse = serde_json::from_str(&body)?;
        Ok(payload.secure_url)
    }
}

/// Stand-in when no image store is configured; every resolution falls back
/// to the placeholder path.
pub struct DisabledUploader;

#[async_trait(?Send)]
impl ImageUploader for DisabledUploader {
    async fn upload(&self, _: &str, _: &str, _: &str) -> Result<String, UploadError> {
        Err(UploadError::NotConfigured)
    }
}
