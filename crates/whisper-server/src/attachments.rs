//! Encrypted attachment storage.
//!
//! Blobs are opaque ciphertext on local disk, addressed by object key
//! (`{ownerId}/{uuid}`). Metadata and per-recipient grants live in SQLite.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use whisper_shared::validation::{validate_content_type, validate_object_key};
use whisper_store::AttachmentRecord;

use crate::db::DbHandle;
use crate::error::{Result, ServerError};

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => {
                return Err(ServerError::InvalidPayload(
                    "Path traversal detected".to_string(),
                ));
            }
        }
    }
    if !resolved.starts_with(base) || resolved == base {
        return Err(ServerError::InvalidPayload(
            "Path traversal detected".to_string(),
        ));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self { base_path })
    }

    fn path_for(&self, object_key: &str) -> Result<PathBuf> {
        validate_object_key(object_key)?;
        ensure_within(&self.base_path, Path::new(object_key))
    }

    pub async fn write(&self, object_key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(object_key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ServerError::Internal(format!("Failed to create blob dir: {e}")))?;
        }
        fs::write(&path, data).await.map_err(|e| {
            ServerError::Internal(format!("Failed to write blob {object_key}: {e}"))
        })?;
        debug!(object_key, size = data.len(), "Stored blob");
        Ok(())
    }

    pub async fn read(&self, object_key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(object_key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound("attachment".to_string()))
            }
            Err(e) => Err(ServerError::Internal(format!(
                "Failed to read blob {object_key}: {e}"
            ))),
        }
    }

    pub async fn delete(&self, object_key: &str) -> Result<bool> {
        let path = self.path_for(object_key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ServerError::Internal(format!(
                "Failed to delete blob {object_key}: {e}"
            ))),
        }
    }
}

pub struct AttachmentService {
    blobs: BlobStore,
    db: DbHandle,
    max_size: u64,
}

impl AttachmentService {
    pub fn new(blobs: BlobStore, db: DbHandle, max_size: u64) -> Self {
        Self {
            blobs,
            db,
            max_size,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Store a new blob owned by `owner_id` and return its object key.
    pub async fn upload(&self, owner_id: &str, content_type: &str, data: &[u8]) -> Result<String> {
        validate_content_type(content_type)?;
        if data.is_empty() {
            return Err(ServerError::InvalidPayload("Empty attachment".to_string()));
        }
        if data.len() as u64 > self.max_size {
            return Err(ServerError::TooLarge {
                size: data.len() as u64,
                max: self.max_size,
            });
        }

        let object_key = format!("{owner_id}/{}", Uuid::new_v4());
        self.blobs.write(&object_key, data).await?;

        let record = AttachmentRecord {
            object_key: object_key.clone(),
            owner_id: owner_id.to_string(),
            content_type: content_type.to_string(),
            size: data.len() as i64,
            created_at: Utc::now(),
        };
        if let Err(e) = self
            .db
            .call(move |db| Ok(db.insert_attachment(&record)?))
            .await
        {
            let _ = self.blobs.delete(&object_key).await;
            return Err(e);
        }

        info!(object_key = %object_key, size = data.len(), "Attachment uploaded");
        Ok(object_key)
    }

    /// Whether the object exists and `whisper_id` may reference it (owner or
    /// an earlier recipient forwarding it).
    pub async fn exists(&self, object_key: &str, whisper_id: &str) -> Result<bool> {
        let key = object_key.to_string();
        let wid = whisper_id.to_string();
        self.db
            .call(move |db| {
                Ok(db.get_attachment(&key)?.is_some() && db.can_access_attachment(&key, &wid)?)
            })
            .await
    }

    pub async fn grant_access(&self, object_key: &str, recipient_id: &str) -> Result<()> {
        let key = object_key.to_string();
        let wid = recipient_id.to_string();
        self.db
            .call(move |db| Ok(db.grant_attachment(&key, &wid, Utc::now())?))
            .await
    }

    /// Fetch a blob for its owner or a grantee.
    pub async fn download(
        &self,
        object_key: &str,
        requester: &str,
    ) -> Result<(AttachmentRecord, Vec<u8>)> {
        validate_object_key(object_key)?;
        let key = object_key.to_string();
        let wid = requester.to_string();
        let (record, allowed) = self
            .db
            .call(move |db| {
                let record = db
                    .get_attachment(&key)?
                    .ok_or_else(|| ServerError::NotFound("attachment".to_string()))?;
                let allowed = db.can_access_attachment(&key, &wid)?;
                Ok((record, allowed))
            })
            .await?;
        if !allowed {
            return Err(ServerError::Forbidden("no access to attachment".to_string()));
        }
        let data = self.blobs.read(object_key).await?;
        Ok((record, data))
    }

    /// Best-effort removal of blobs whose records are already gone.
    pub async fn delete_blobs(&self, object_keys: &[String]) {
        for key in object_keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(object_key = %key, error = %e, "Failed to delete attachment blob");
            }
        }
    }
}
