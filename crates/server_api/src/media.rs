use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use shared::domain::UserId;
use storage::Storage;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid base64 image payload")]
    InvalidPayload,
    #[error("media backend unavailable: {0}")]
    Unavailable(&'static str),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Blob-store collaborator: base64 in, servable URL out. Upload failures
/// abort a send before anything is persisted.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, owner_id: UserId, base64_data: &str) -> Result<String, MediaError>;
}

/// Keeps decoded blobs in the relational store's media table; the server
/// serves them back from `/media/:id`.
pub struct StorageMediaStore {
    storage: Storage,
    public_base: String,
}

impl StorageMediaStore {
    pub fn new(storage: Storage, public_base: impl Into<String>) -> Self {
        Self {
            storage,
            public_base: public_base.into(),
        }
    }
}

#[async_trait]
impl MediaStore for StorageMediaStore {
    async fn upload(&self, owner_id: UserId, base64_data: &str) -> Result<String, MediaError> {
        let (content_type, encoded) = split_data_url(base64_data);
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| MediaError::InvalidPayload)?;
        if bytes.is_empty() {
            return Err(MediaError::InvalidPayload);
        }
        let media_id = self.storage.store_media(owner_id, &bytes, content_type).await?;
        Ok(format!(
            "{}/media/{}",
            self.public_base.trim_end_matches('/'),
            media_id.0
        ))
    }
}

/// `"data:image/png;base64,AAAA"` → `(Some("image/png"), "AAAA")`; plain
/// base64 passes through untouched.
fn split_data_url(payload: &str) -> (Option<&str>, &str) {
    let Some(rest) = payload.strip_prefix("data:") else {
        return (None, payload);
    };
    match rest.split_once(";base64,") {
        Some((mime, data)) => (Some(mime).filter(|m| !m.is_empty()), data),
        None => (None, payload),
    }
}

/// Stand-in for deployments without a media backend; uploads fail cleanly.
pub struct MissingMediaStore;

#[async_trait]
impl MediaStore for MissingMediaStore {
    async fn upload(&self, _owner_id: UserId, _base64_data: &str) -> Result<String, MediaError> {
        Err(MediaError::Unavailable("no media backend configured"))
    }
}
