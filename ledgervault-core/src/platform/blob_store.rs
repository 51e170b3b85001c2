//! Blob store interface for encrypted envelopes.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::VaultResult;
use crate::types::BlobId;

/// Content storage for encrypted envelopes.
///
/// Blobs are immutable once stored. Deleting them is not part of the
/// interface: the engine only drops references on the ledger.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` and returns their identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    async fn put(&self, bytes: Vec<u8>) -> VaultResult<BlobId>;

    /// Fetches several blobs at once.
    ///
    /// Partial failure is not an error: every requested identifier appears in
    /// the map, with `None` for blobs that could not be fetched.
    ///
    /// # Errors
    ///
    /// Returns an error only if the whole request failed.
    async fn get_many(&self, ids: &[BlobId]) -> VaultResult<HashMap<BlobId, Option<Vec<u8>>>>;
}
