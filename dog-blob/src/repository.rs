use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Blob, BlobCreate, BlobFilter, BlobId, BlobResult, BlobUpdate, Condition, DeviceLogsBlob,
    DeviceLogsCreate, DeviceLogsFilter, DeviceLogsUpdate, Pagination,
};

/// Number of fresh ids tried before `create` gives up with a conflict.
pub const CREATE_ID_ATTEMPTS: usize = 3;

/// Source of fresh blob ids
pub type IdGenerator = Arc<dyn Fn() -> BlobId + Send + Sync>;

/// Random 32-hex-character ids.
pub fn random_ids() -> IdGenerator {
    Arc::new(BlobId::new)
}

/// Metadata repository for blob records
///
/// Implementations validate inputs before touching storage. A missing
/// record, a tombstoned record and a revision that does not match the
/// supplied [`Condition`] all surface as `None` / `false`, never as errors.
#[async_trait]
pub trait BlobRepository: Send + Sync {
    /// Live records of `user_id` matching `filter`, newest first
    async fn list(
        &self,
        user_id: &str,
        filter: &BlobFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<Blob>>;

    /// Reserve a record in `created` state with a fresh id
    async fn create(&self, user_id: &str, create: &BlobCreate) -> BlobResult<Blob>;

    async fn get(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<Option<Blob>>;

    /// Sparse update; bumps the revision. An empty patch reads without writing.
    async fn update(
        &self,
        id: &BlobId,
        condition: Option<&Condition>,
        update: &BlobUpdate,
    ) -> BlobResult<Option<Blob>>;

    /// Tombstone a live record
    async fn delete(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool>;

    /// Physically remove a record, tombstoned or not
    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool>;

    /// Tombstone every live record of a user
    async fn delete_all(&self, user_id: &str) -> BlobResult<bool>;

    /// Remove every record of a user
    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool>;
}

/// Metadata repository for device-logs records
///
/// There is no soft delete; records are destroyed directly. `get` is not
/// scoped to an owner.
#[async_trait]
pub trait DeviceLogsRepository: Send + Sync {
    /// Finalized records of `user_id` inside the filter window, latest start first
    async fn list(
        &self,
        user_id: &str,
        filter: &DeviceLogsFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<DeviceLogsBlob>>;

    async fn create(&self, user_id: &str, create: &DeviceLogsCreate)
        -> BlobResult<DeviceLogsBlob>;

    async fn get(&self, id: &BlobId) -> BlobResult<Option<DeviceLogsBlob>>;

    async fn update(
        &self,
        id: &BlobId,
        condition: Option<&Condition>,
        update: &DeviceLogsUpdate,
    ) -> BlobResult<Option<DeviceLogsBlob>>;

    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool>;

    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool>;
}
