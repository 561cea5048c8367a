//! Reply threading state.
//!
//! Each forwarded message leaves behind a [`ForwardInfo`] record keyed by
//! the id the mailer assigned to the forwarded copy. When the private
//! account replies, the copy's id comes back in `In-Reply-To` and leads to
//! the original inbound message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{blob_key, BlobStore, StorageError, StorageResult};

/// Links a forwarded copy back to the inbound message it was made from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardInfo {
    /// `Message-ID` header of the inbound message, brackets trimmed.
    pub original_message_id: String,

    /// Platform id of the inbound message, its storage key.
    pub ses_id: String,

    /// Send id of the forwarded copy.
    pub forwarded_id: String,
}

/// Stores [`ForwardInfo`] records as JSON under a key prefix.
#[derive(Clone)]
pub struct CorrelationStore {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl CorrelationStore {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    /// Writes the record under its `forwarded_id`.
    pub async fn put(&self, info: &ForwardInfo) -> StorageResult<()> {
        let data =
            serde_json::to_vec(info).map_err(|e| StorageError::EngineError(e.to_string()))?;
        let key = blob_key(&self.prefix, &info.forwarded_id);
        self.store.put(&key, data).await?;
        debug!(key = %key, ses_id = %info.ses_id, "Stored forward info");
        Ok(())
    }

    /// Reads the record of the forwarded copy `forwarded_id`.
    pub async fn get(&self, forwarded_id: &str) -> StorageResult<ForwardInfo> {
        let data = self
            .store
            .get(&blob_key(&self.prefix, forwarded_id))
            .await?;
        serde_json::from_slice(&data).map_err(|e| {
            StorageError::EngineError(format!("invalid forward info {forwarded_id}: {e}"))
        })
    }
}
