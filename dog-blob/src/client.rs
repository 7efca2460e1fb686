use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn, Span};

use crate::digest::DigestingStream;
use crate::store::{validate_owner, PutOptions};
use crate::{
    Blob, BlobConfig, BlobContent, BlobCreate, BlobCtx, BlobError, BlobFilter, BlobId,
    BlobRepository, BlobResult, BlobUpdate, ByteStream, Condition, ContentStore, OpenedContent,
    Pagination,
};

/// Digest and size observed while storing verified content.
pub(crate) struct Verified {
    pub digest_md5: String,
    pub size: u64,
}

/// What has to be undone after a failed create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cleanup {
    /// The put failed; no content to remove.
    Metadata,
    ContentAndMetadata,
}

/// Stream `body` into the store through the digest tee, then check size and digest.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn store_verified(
    ctx: &BlobCtx,
    store: &dyn ContentStore,
    config: &BlobConfig,
    user_id: &str,
    id: &BlobId,
    body: ByteStream,
    expected_digest_md5: Option<String>,
    media_type: Option<String>,
) -> Result<Verified, (BlobError, Cleanup)> {
    let (stream, observer) = DigestingStream::new(body, config.size_maximum);
    let put = store.put(
        user_id,
        id,
        stream.into_byte_stream(),
        PutOptions::with_media_type(media_type),
    );
    match ctx.run(put).await {
        Ok(()) => {}
        Err(BlobError::Cancelled) => return Err((BlobError::Cancelled, Cleanup::ContentAndMetadata)),
        Err(err) => return Err((err, Cleanup::Metadata)),
    }

    if observer.exceeds_maximum() {
        debug!(blob_id = %id, size_maximum = config.size_maximum, "content exceeds maximum size");
        return Err((
            BlobError::ResourceTooLarge {
                size_maximum: config.size_maximum,
            },
            Cleanup::ContentAndMetadata,
        ));
    }

    let digest_md5 = observer.digest_md5();
    if let Some(expected) = expected_digest_md5 {
        if expected != digest_md5 {
            return Err((
                BlobError::digests_not_equal(expected, digest_md5),
                Cleanup::ContentAndMetadata,
            ));
        }
    }

    Ok(Verified {
        digest_md5,
        size: observer.size(),
    })
}

/// Best-effort content removal during cleanup.
pub(crate) async fn discard_content(store: &dyn ContentStore, user_id: &str, id: &BlobId) {
    match store.delete(user_id, id).await {
        Ok(_) => debug!(blob_id = %id, "content discarded"),
        Err(err) => warn!(blob_id = %id, error = %err, "failed to discard content during cleanup"),
    }
}

/// Orchestrates blob metadata and content across a repository and a content store
///
/// A blob becomes `available` only after its content is stored and verified.
/// Any failure on the way is compensated by removing what was written.
#[derive(Clone)]
pub struct BlobClient {
    repository: Arc<dyn BlobRepository>,
    store: Arc<dyn ContentStore>,
    config: BlobConfig,
}

impl BlobClient {
    pub fn new(
        repository: Arc<dyn BlobRepository>,
        store: Arc<dyn ContentStore>,
        config: BlobConfig,
    ) -> Self {
        Self {
            repository,
            store,
            config,
        }
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Live blobs of `user_id` matching `filter`, newest first
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn list(
        &self,
        ctx: &BlobCtx,
        user_id: &str,
        filter: &BlobFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<Blob>> {
        validate_owner(user_id)?;
        ctx.run(self.repository.list(user_id, filter, pagination)).await
    }

    /// Reserve, stream, verify and finalize a new blob.
    #[instrument(
        skip(self, ctx, content),
        fields(request_id = %ctx.request_id, blob_id = tracing::field::Empty)
    )]
    pub async fn create(
        &self,
        ctx: &BlobCtx,
        user_id: &str,
        content: BlobContent,
    ) -> BlobResult<Blob> {
        validate_owner(user_id)?;
        content.validate()?;
        let BlobContent {
            body,
            digest_md5,
            media_type,
        } = content;

        let create = BlobCreate {
            media_type: media_type.clone(),
        };
        let blob = ctx.run(self.repository.create(user_id, &create)).await?;
        Span::current().record("blob_id", tracing::field::display(&blob.id));
        debug!("blob reserved");

        let verified = match store_verified(
            ctx,
            self.store.as_ref(),
            &self.config,
            user_id,
            &blob.id,
            body,
            digest_md5,
            media_type,
        )
        .await
        {
            Ok(verified) => verified,
            Err((err, cleanup)) => {
                self.discard(user_id, &blob.id, cleanup).await;
                return Err(err);
            }
        };

        let finalize = BlobUpdate::finalize(verified.digest_md5, verified.size);
        match ctx.run(self.repository.update(&blob.id, None, &finalize)).await {
            Ok(Some(blob)) => {
                info!(size = verified.size, "blob available");
                Ok(blob)
            }
            Ok(None) => {
                warn!("blob record vanished before finalize");
                self.discard(user_id, &blob.id, Cleanup::ContentAndMetadata).await;
                Err(BlobError::not_found(blob.id.as_str()))
            }
            Err(err) => {
                self.discard(user_id, &blob.id, Cleanup::ContentAndMetadata).await;
                Err(err)
            }
        }
    }

    /// A live blob, whatever its status
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get(&self, ctx: &BlobCtx, id: &BlobId) -> BlobResult<Option<Blob>> {
        ctx.run(self.repository.get(id, None)).await
    }

    /// Open the content of an available blob.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_content(&self, ctx: &BlobCtx, id: &BlobId) -> BlobResult<Option<OpenedContent>> {
        let Some(blob) = self.get(ctx, id).await? else {
            return Ok(None);
        };
        if !blob.is_available() {
            debug!("blob has no content yet");
            return Ok(None);
        }

        match ctx.run(self.store.get(&blob.user_id, &blob.id)).await? {
            Some(stream) => Ok(Some(OpenedContent {
                stream,
                digest_md5: blob.digest_md5,
                media_type: blob.media_type,
                size: blob.size,
            })),
            None => {
                error!(user_id = %blob.user_id, "blob content missing for available metadata");
                Ok(None)
            }
        }
    }

    /// Tombstone, remove content, then destroy the record.
    ///
    /// Returns `false` when nothing matched `id` and `condition`.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete(
        &self,
        ctx: &BlobCtx,
        id: &BlobId,
        condition: Option<&Condition>,
    ) -> BlobResult<bool> {
        let Some(blob) = ctx.run(self.repository.get(id, condition)).await? else {
            return Ok(false);
        };
        if !ctx.run(self.repository.delete(id, condition)).await? {
            return Ok(false);
        }

        if !ctx.run(self.store.delete(&blob.user_id, id)).await? {
            warn!(user_id = %blob.user_id, "blob content already missing during delete");
        }

        let destroyed = ctx.run(self.repository.destroy(id, None)).await?;
        info!(destroyed, "blob deleted");
        Ok(destroyed)
    }

    /// Delete every blob of `user_id`.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete_all(&self, ctx: &BlobCtx, user_id: &str) -> BlobResult<()> {
        validate_owner(user_id)?;
        if !ctx.run(self.repository.delete_all(user_id)).await? {
            debug!("no blobs to delete");
            return Ok(());
        }
        ctx.run(self.store.delete_all(user_id)).await?;
        ctx.run(self.repository.destroy_all(user_id)).await?;
        info!("all blobs deleted");
        Ok(())
    }

    /// Compensate a failed create. Runs outside the request context.
    async fn discard(&self, user_id: &str, id: &BlobId, cleanup: Cleanup) {
        if cleanup == Cleanup::ContentAndMetadata {
            discard_content(self.store.as_ref(), user_id, id).await;
        }
        if let Err(err) = self.repository.destroy(id, None).await {
            warn!(blob_id = %id, error = %err, "failed to destroy blob record during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlobRepository, MemoryContentStore};
    use crate::repository::BlobRepository;
    use crate::store::ContentStore;
    use crate::testing::read_to_end;
    use crate::{BlobStatus, BlobUpdate};
    use async_trait::async_trait;
    use tracing_test::traced_test;

    const DIGEST_HELLO: &str = "XUFAKrxLKna5cZ2REBfFkg==";

    fn client_with(
        repository: Arc<dyn BlobRepository>,
        store: Arc<dyn ContentStore>,
    ) -> BlobClient {
        BlobClient::new(repository, store, BlobConfig::new())
    }

    /// Store whose deletes always fail.
    struct UndeletableStore(MemoryContentStore);

    #[async_trait]
    impl ContentStore for UndeletableStore {
        async fn exists(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool> {
            self.0.exists(owner_id, id).await
        }

        async fn put(
            &self,
            owner_id: &str,
            id: &BlobId,
            stream: ByteStream,
            options: PutOptions,
        ) -> BlobResult<()> {
            self.0.put(owner_id, id, stream, options).await
        }

        async fn get(&self, owner_id: &str, id: &BlobId) -> BlobResult<Option<ByteStream>> {
            self.0.get(owner_id, id).await
        }

        async fn delete(&self, _owner_id: &str, _id: &BlobId) -> BlobResult<bool> {
            Err(BlobError::backend(std::io::Error::other("store offline")))
        }

        async fn delete_all(&self, owner_id: &str) -> BlobResult<()> {
            self.0.delete_all(owner_id).await
        }
    }

    /// Repository whose finalize step fails or loses the record.
    struct FlakyFinalize {
        inner: MemoryBlobRepository,
        lose_record: bool,
    }

    #[async_trait]
    impl BlobRepository for FlakyFinalize {
        async fn list(
            &self,
            user_id: &str,
            filter: &BlobFilter,
            pagination: &Pagination,
        ) -> BlobResult<Vec<Blob>> {
            self.inner.list(user_id, filter, pagination).await
        }

        async fn create(&self, user_id: &str, create: &BlobCreate) -> BlobResult<Blob> {
            self.inner.create(user_id, create).await
        }

        async fn get(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<Option<Blob>> {
            self.inner.get(id, condition).await
        }

        async fn update(
            &self,
            _id: &BlobId,
            _condition: Option<&Condition>,
            _update: &BlobUpdate,
        ) -> BlobResult<Option<Blob>> {
            if self.lose_record {
                Ok(None)
            } else {
                Err(BlobError::backend(std::io::Error::other("metadata offline")))
            }
        }

        async fn delete(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
            self.inner.delete(id, condition).await
        }

        async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
            self.inner.destroy(id, condition).await
        }

        async fn delete_all(&self, user_id: &str) -> BlobResult<bool> {
            self.inner.delete_all(user_id).await
        }

        async fn destroy_all(&self, user_id: &str) -> BlobResult<bool> {
            self.inner.destroy_all(user_id).await
        }
    }

    #[tokio::test]
    async fn create_finalizes_with_observed_digest() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository.clone(), store.clone());

        let blob = client
            .create(
                &BlobCtx::new(),
                "user-1",
                BlobContent::from_bytes("hello").with_media_type("text/plain"),
            )
            .await
            .unwrap();
        assert_eq!(blob.status, BlobStatus::Available);
        assert_eq!(blob.digest_md5.as_deref(), Some(DIGEST_HELLO));
        assert_eq!(blob.size, Some(5));
        assert_eq!(blob.revision, 1);
        assert_eq!(store.media_type("user-1", &blob.id).as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_content_is_reported_as_inconsistency() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository, store.clone());
        let ctx = BlobCtx::new();

        let blob = client
            .create(&ctx, "user-1", BlobContent::from_bytes("hello"))
            .await
            .unwrap();
        store.delete("user-1", &blob.id).await.unwrap();

        assert!(client.get(&ctx, &blob.id).await.unwrap().is_some());
        assert!(client.get_content(&ctx, &blob.id).await.unwrap().is_none());
        assert!(logs_contain("blob content missing for available metadata"));
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_tolerates_missing_content() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository.clone(), store.clone());
        let ctx = BlobCtx::new();

        let blob = client
            .create(&ctx, "user-1", BlobContent::from_bytes("hello"))
            .await
            .unwrap();
        store.delete("user-1", &blob.id).await.unwrap();

        assert!(client.delete(&ctx, &blob.id, None).await.unwrap());
        assert!(repository.is_empty());
        assert!(logs_contain("blob content already missing during delete"));
    }

    #[tokio::test]
    #[traced_test]
    async fn cleanup_failure_never_masks_the_primary_error() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(UndeletableStore(MemoryContentStore::new()));
        let client = client_with(repository.clone(), store);

        let err = client
            .create(
                &BlobCtx::new(),
                "user-1",
                BlobContent::from_bytes("hello").with_digest_md5("1B2M2Y8AsgTpgAmY7PhCfg=="),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::DigestsNotEqual { .. }));
        assert!(repository.is_empty(), "metadata is still destroyed");
        assert!(logs_contain("failed to discard content during cleanup"));
    }

    #[tokio::test]
    async fn failed_finalize_removes_everything() {
        let repository = Arc::new(FlakyFinalize {
            inner: MemoryBlobRepository::new(),
            lose_record: false,
        });
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository.clone(), store.clone());

        let err = client
            .create(&BlobCtx::new(), "user-1", BlobContent::from_bytes("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Backend { .. }));
        assert!(repository.inner.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn vanished_record_at_finalize_is_not_found() {
        let repository = Arc::new(FlakyFinalize {
            inner: MemoryBlobRepository::new(),
            lose_record: true,
        });
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository.clone(), store.clone());

        let err = client
            .create(&BlobCtx::new(), "user-1", BlobContent::from_bytes("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
        assert!(repository.inner.is_empty());
        assert!(store.is_empty());
        assert!(logs_contain("blob record vanished before finalize"));
    }

    #[tokio::test]
    async fn created_blobs_have_no_content_to_open() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(MemoryContentStore::new());
        let client = client_with(repository.clone(), store);
        let ctx = BlobCtx::new();

        let pending = repository.create("user-1", &BlobCreate::new()).await.unwrap();
        assert!(client.get(&ctx, &pending.id).await.unwrap().is_some());
        assert!(client.get_content(&ctx, &pending.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opened_content_carries_metadata() {
        let repository = Arc::new(MemoryBlobRepository::new());
        let store = Arc::new(MemoryContentStore::new().with_chunk_size(2));
        let client = client_with(repository, store);
        let ctx = BlobCtx::new();

        let blob = client
            .create(
                &ctx,
                "user-1",
                BlobContent::from_bytes("hello").with_media_type("text/plain"),
            )
            .await
            .unwrap();
        let opened = client.get_content(&ctx, &blob.id).await.unwrap().unwrap();
        assert_eq!(opened.digest_md5.as_deref(), Some(DIGEST_HELLO));
        assert_eq!(opened.media_type.as_deref(), Some("text/plain"));
        assert_eq!(opened.size, Some(5));
        assert_eq!(read_to_end(opened.stream).await.unwrap(), b"hello".to_vec());
    }
}
