//! Conversation history in sled and uploaded images on the local filesystem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::settings::{ServerConfig, StorageConfig};

/// One question and answer, as shown in the chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub user_id: String,
    pub query: Option<String>,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub model_used: String,
    pub strategy: String,
    pub image_url: Option<String>,
    pub image_filename: Option<String>,
}

/// Records keyed `<uid>\0<millis>-<uuid>` so a prefix scan yields one user's
/// history in time order.
#[derive(Clone)]
pub struct ConversationStore {
    tree: sled::Tree,
}

impl ConversationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open conversation database at {:?}", path))?;
        info!("Conversation database opened at {:?}", path);
        Self::from_db(&db)
    }

    /// In-memory database removed on drop, for tests and one-shot runs.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("conversations")?,
        })
    }

    fn prefix(user_id: &str) -> Vec<u8> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0);
        prefix
    }

    pub async fn append(&self, record: &ConversationRecord) -> Result<()> {
        let mut key = Self::prefix(&record.user_id);
        key.extend_from_slice(
            format!("{:020}-{}", record.timestamp.timestamp_millis(), Uuid::new_v4()).as_bytes(),
        );
        let value = bincode::serialize(record)?;
        self.tree.insert(key, value)?;
        self.tree.flush_async().await?;
        debug!("Stored conversation for user '{}'", record.user_id);
        Ok(())
    }

    /// Newest first, at most `limit` records.
    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationRecord>> {
        self.tree
            .scan_prefix(Self::prefix(user_id))
            .rev()
            .take(limit)
            .map(|item| {
                let (_, bytes) = item?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }
}

/// Where an uploaded image ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMedia {
    pub relative_path: String,
    pub url: String,
    pub filename: String,
}

pub struct MediaStore {
    root: PathBuf,
    app_id: String,
    public_base_url: String,
}

impl MediaStore {
    pub fn new(storage: &StorageConfig, server: &ServerConfig) -> Self {
        Self {
            root: storage.media_dir.clone(),
            app_id: storage.app_id.clone(),
            public_base_url: server.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write under `artifacts/<app>/users/<uid>/images/<uuid>.<ext>`.
    pub async fn save(
        &self,
        user_id: &str,
        mime_type: &str,
        data: &[u8],
        original_name: Option<&str>,
    ) -> Result<StoredMedia> {
        let ext = extension_for(mime_type, original_name);
        let filename = format!("{}.{}", Uuid::new_v4(), ext);
        let relative_path = format!(
            "artifacts/{}/users/{}/images/{}",
            path_segment(&self.app_id),
            path_segment(user_id),
            filename
        );

        let full = self.root.join(&relative_path);
        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create media directory {:?}", dir))?;
        }
        tokio::fs::write(&full, data)
            .await
            .with_context(|| format!("Failed to write media file {:?}", full))?;
        info!("Stored {} bytes of {} at {}", data.len(), mime_type, relative_path);

        Ok(StoredMedia {
            url: format!("{}/media/{}", self.public_base_url, relative_path),
            relative_path,
            filename: original_name.unwrap_or(&filename).to_string(),
        })
    }
}

fn extension_for(mime_type: &str, original_name: Option<&str>) -> String {
    original_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .or_else(|| match mime_type {
            "image/jpeg" | "image/jpg" => Some("jpg".to_string()),
            _ => mime_guess::get_mime_extensions_str(mime_type)
                .and_then(|exts| exts.first())
                .map(|e| e.to_string()),
        })
        .unwrap_or_else(|| "jpg".to_string())
}

/// Keep user-controlled names inside their directory.
fn path_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
