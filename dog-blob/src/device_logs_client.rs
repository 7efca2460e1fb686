use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn, Span};

use crate::client::{discard_content, store_verified, Cleanup};
use crate::store::{get_many_buffered, validate_owner};
use crate::{
    BlobConfig, BlobCtx, BlobError, BlobId, BlobResult, ContentStore, DeviceLogsBlob,
    DeviceLogsContent, DeviceLogsCreate, DeviceLogsFilter, DeviceLogsRepository, DeviceLogsUpdate,
    OpenedContent, OpenedDeviceLogs, Pagination,
};

/// Orchestrates device-logs metadata and content
///
/// Same create protocol as [`crate::BlobClient`]; records are finalized with
/// the time range their content covers and are destroyed without a tombstone.
///
/// Give this client its own [`ContentStore`] (or bucket prefix). Content is
/// keyed by owner only, so [`DeviceLogsClient::delete_all`] would also remove
/// blob content written by a `BlobClient` sharing the store.
#[derive(Clone)]
pub struct DeviceLogsClient {
    repository: Arc<dyn DeviceLogsRepository>,
    store: Arc<dyn ContentStore>,
    config: BlobConfig,
}

impl DeviceLogsClient {
    pub fn new(
        repository: Arc<dyn DeviceLogsRepository>,
        store: Arc<dyn ContentStore>,
        config: BlobConfig,
    ) -> Self {
        Self {
            repository,
            store,
            config,
        }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn list(
        &self,
        ctx: &BlobCtx,
        user_id: &str,
        filter: &DeviceLogsFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<DeviceLogsBlob>> {
        validate_owner(user_id)?;
        ctx.run(self.repository.list(user_id, filter, pagination)).await
    }

    #[instrument(
        skip(self, ctx, content),
        fields(request_id = %ctx.request_id, blob_id = tracing::field::Empty)
    )]
    pub async fn create(
        &self,
        ctx: &BlobCtx,
        user_id: &str,
        content: DeviceLogsContent,
    ) -> BlobResult<DeviceLogsBlob> {
        validate_owner(user_id)?;
        content.validate()?;
        let DeviceLogsContent {
            body,
            digest_md5,
            media_type,
            start_at,
            end_at,
        } = content;

        let create = DeviceLogsCreate {
            media_type: media_type.clone(),
        };
        let blob = ctx.run(self.repository.create(user_id, &create)).await?;
        Span::current().record("blob_id", tracing::field::display(&blob.id));

        let verified = match store_verified(
            ctx,
            self.store.as_ref(),
            &self.config,
            user_id,
            &blob.id,
            body,
            digest_md5,
            media_type.clone(),
        )
        .await
        {
            Ok(verified) => verified,
            Err((err, cleanup)) => {
                self.discard(user_id, &blob.id, cleanup).await;
                return Err(err);
            }
        };

        let finalize = DeviceLogsUpdate {
            digest_md5: Some(verified.digest_md5),
            media_type,
            size: Some(verified.size),
            start_at_time: Some(start_at),
            end_at_time: Some(end_at),
        };
        match ctx.run(self.repository.update(&blob.id, None, &finalize)).await {
            Ok(Some(blob)) => {
                info!(size = verified.size, "device logs stored");
                Ok(blob)
            }
            Ok(None) => {
                warn!("device logs record vanished before finalize");
                self.discard(user_id, &blob.id, Cleanup::ContentAndMetadata).await;
                Err(BlobError::not_found(blob.id.as_str()))
            }
            Err(err) => {
                self.discard(user_id, &blob.id, Cleanup::ContentAndMetadata).await;
                Err(err)
            }
        }
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get(&self, ctx: &BlobCtx, id: &BlobId) -> BlobResult<Option<DeviceLogsBlob>> {
        ctx.run(self.repository.get(id)).await
    }

    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn get_content(&self, ctx: &BlobCtx, id: &BlobId) -> BlobResult<Option<OpenedContent>> {
        let Some(blob) = self.get(ctx, id).await? else {
            return Ok(None);
        };
        if !blob.is_finalized() {
            debug!("device logs have no content yet");
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
                error!(user_id = %blob.user_id, "device logs content missing for finalized metadata");
                Ok(None)
            }
        }
    }

    /// List records and open their content, at most `get_many_concurrency` fetches at a time.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn list_content(
        &self,
        ctx: &BlobCtx,
        user_id: &str,
        filter: &DeviceLogsFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<OpenedDeviceLogs>> {
        let blobs = self.list(ctx, user_id, filter, pagination).await?;
        let ids: Vec<BlobId> = blobs.iter().map(|blob| blob.id.clone()).collect();
        let streams = ctx
            .run(get_many_buffered(
                self.store.as_ref(),
                user_id,
                &ids,
                self.config.get_many_concurrency,
            ))
            .await?;

        Ok(blobs
            .into_iter()
            .zip(streams)
            .map(|(blob, stream)| OpenedDeviceLogs { blob, stream })
            .collect())
    }

    /// Remove content, then destroy the record.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete(&self, ctx: &BlobCtx, id: &BlobId) -> BlobResult<bool> {
        let Some(blob) = self.get(ctx, id).await? else {
            return Ok(false);
        };
        if !ctx.run(self.store.delete(&blob.user_id, id)).await? {
            warn!(user_id = %blob.user_id, "device logs content already missing during delete");
        }
        let destroyed = ctx.run(self.repository.destroy(id, None)).await?;
        info!(destroyed, "device logs deleted");
        Ok(destroyed)
    }

    /// Delete all device logs of `user_id`, clearing every object stored
    /// under that owner in this client's store.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete_all(&self, ctx: &BlobCtx, user_id: &str) -> BlobResult<()> {
        validate_owner(user_id)?;
        ctx.run(self.store.delete_all(user_id)).await?;
        ctx.run(self.repository.destroy_all(user_id)).await?;
        info!("all device logs deleted");
        Ok(())
    }

    async fn discard(&self, user_id: &str, id: &BlobId, cleanup: Cleanup) {
        if cleanup == Cleanup::ContentAndMetadata {
            discard_content(self.store.as_ref(), user_id, id).await;
        }
        if let Err(err) = self.repository.destroy(id, None).await {
            warn!(blob_id = %id, error = %err, "failed to destroy device logs record during cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::bytes_stream;
    use crate::memory::{MemoryContentStore, MemoryDeviceLogsRepository};
    use crate::testing::read_to_end;
    use chrono::{Duration, Utc};
    use tracing_test::traced_test;

    fn setup() -> (
        DeviceLogsClient,
        Arc<MemoryDeviceLogsRepository>,
        Arc<MemoryContentStore>,
    ) {
        let repository = Arc::new(MemoryDeviceLogsRepository::new());
        let store = Arc::new(MemoryContentStore::new());
        let client = DeviceLogsClient::new(repository.clone(), store.clone(), BlobConfig::new());
        (client, repository, store)
    }

    #[tokio::test]
    async fn create_finalizes_time_range() {
        let (client, _, _) = setup();
        let start = Utc::now() - Duration::hours(1);
        let end = Utc::now();

        let blob = client
            .create(
                &BlobCtx::new(),
                "device-owner",
                DeviceLogsContent::new(bytes_stream("hello"), start, end)
                    .with_digest_md5("XUFAKrxLKna5cZ2REBfFkg==")
                    .with_media_type("application/json"),
            )
            .await
            .unwrap();
        assert!(blob.is_finalized());
        assert_eq!(blob.start_at_time, Some(start));
        assert_eq!(blob.end_at_time, Some(end));
        assert_eq!(blob.size, Some(5));
        assert_eq!(blob.media_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn digest_mismatch_leaves_nothing_behind() {
        let (client, repository, store) = setup();
        let now = Utc::now();

        let err = client
            .create(
                &BlobCtx::new(),
                "device-owner",
                DeviceLogsContent::new(bytes_stream("hello"), now, now)
                    .with_digest_md5("1B2M2Y8AsgTpgAmY7PhCfg=="),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::DigestsNotEqual { .. }));
        assert!(repository.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_content_pairs_records_with_streams() {
        let (client, _, _) = setup();
        let ctx = BlobCtx::new();
        let base = Utc::now() - Duration::days(1);

        for hour in 0..5 {
            let start = base + Duration::hours(hour);
            client
                .create(
                    &ctx,
                    "device-owner",
                    DeviceLogsContent::new(
                        bytes_stream(format!("log-{}", hour)),
                        start,
                        start + Duration::minutes(30),
                    ),
                )
                .await
                .unwrap();
        }

        let opened = client
            .list_content(&ctx, "device-owner", &DeviceLogsFilter::new(), &Pagination::default())
            .await
            .unwrap();
        assert_eq!(opened.len(), 5);
        let mut expected_hour = 4;
        for item in opened {
            assert_eq!(
                item.blob.start_at_time,
                Some(base + Duration::hours(expected_hour))
            );
            assert_eq!(
                read_to_end(item.stream).await.unwrap(),
                format!("log-{}", expected_hour).into_bytes()
            );
            expected_hour -= 1;
        }
    }

    #[tokio::test]
    async fn delete_destroys_record_and_content() {
        let (client, repository, store) = setup();
        let ctx = BlobCtx::new();
        let now = Utc::now();

        let blob = client
            .create(&ctx, "device-owner", DeviceLogsContent::new(bytes_stream("x"), now, now))
            .await
            .unwrap();
        assert!(client.get_content(&ctx, &blob.id).await.unwrap().is_some());

        assert!(client.delete(&ctx, &blob.id).await.unwrap());
        assert!(!client.delete(&ctx, &blob.id).await.unwrap());
        assert!(client.get(&ctx, &blob.id).await.unwrap().is_none());
        assert!(repository.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_all_clears_one_owner() {
        let (client, repository, store) = setup();
        let ctx = BlobCtx::new();
        let now = Utc::now();

        for owner in ["device-a", "device-a", "device-b"] {
            client
                .create(&ctx, owner, DeviceLogsContent::new(bytes_stream("x"), now, now))
                .await
                .unwrap();
        }
        client.delete_all(&ctx, "device-a").await.unwrap();
        assert_eq!(repository.len(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            client
                .list(&ctx, "device-b", &DeviceLogsFilter::new(), &Pagination::default())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(logs_contain("all device logs deleted"));
    }
}
