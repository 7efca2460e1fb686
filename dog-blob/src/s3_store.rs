use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::{env_optional, env_parse, env_required};
use crate::store::{validate_key, validate_owner, ContentKeyStrategy, DefaultKeyStrategy, PutOptions};
use crate::{BlobError, BlobId, BlobResult, ByteStream, ContentStore};

/// Default multipart part size (8 MiB)
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Smallest part S3 accepts for every part but the last (5 MiB)
pub const MINIMUM_PART_SIZE: usize = 5 * 1024 * 1024;

/// Keys per `DeleteObjects` request
const DELETE_BATCH_SIZE: usize = 1000;

/// S3-compatible object store configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Optional key prefix inside the bucket
    pub prefix: Option<String>,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (RustFS, MinIO)
    pub endpoint_url: Option<String>,
    /// Static credentials; the default provider chain is used when absent
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    /// Bytes buffered per upload part
    pub part_size: usize,
}

impl S3Config {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_endpoint_url<S: Into<String>>(mut self, endpoint_url: S) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    pub fn with_credentials<A: Into<String>, S: Into<String>>(
        mut self,
        access_key_id: A,
        secret_access_key: S,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Required for RustFS and MinIO
    pub fn with_force_path_style(mut self, force_path_style: bool) -> Self {
        self.force_path_style = force_path_style;
        self
    }

    /// Set part size (raised to the S3 minimum)
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MINIMUM_PART_SIZE);
        self
    }

    /// Load from `DOG_BLOB_S3_*` environment variables.
    pub fn from_env() -> BlobResult<Self> {
        let mut config = Self::new(env_required("DOG_BLOB_S3_BUCKET")?);
        if let Some(prefix) = env_optional("DOG_BLOB_S3_PREFIX") {
            config = config.with_prefix(prefix);
        }
        if let Some(region) = env_optional("DOG_BLOB_S3_REGION") {
            config = config.with_region(region);
        }
        if let Some(endpoint_url) = env_optional("DOG_BLOB_S3_ENDPOINT_URL") {
            config = config.with_endpoint_url(endpoint_url);
        }
        match (
            env_optional("DOG_BLOB_S3_ACCESS_KEY_ID"),
            env_optional("DOG_BLOB_S3_SECRET_ACCESS_KEY"),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => {
                config = config.with_credentials(access_key_id, secret_access_key);
            }
            (None, None) => {}
            _ => {
                return Err(BlobError::invalid(
                    "DOG_BLOB_S3_ACCESS_KEY_ID and DOG_BLOB_S3_SECRET_ACCESS_KEY must be set together",
                ))
            }
        }
        if let Some(force_path_style) = env_parse::<bool>("DOG_BLOB_S3_FORCE_PATH_STYLE")? {
            config = config.with_force_path_style(force_path_style);
        }
        if let Some(part_size) = env_parse::<usize>("DOG_BLOB_S3_PART_SIZE")? {
            config = config.with_part_size(part_size);
        }
        Ok(config)
    }

    /// Full object key for a strategy-derived key.
    fn full_key(&self, key: &str) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, key),
            _ => key.to_string(),
        }
    }
}

/// Content store backed by an S3-compatible object store
#[derive(Clone)]
pub struct S3ContentStore {
    client: Client,
    config: S3Config,
    keys: Arc<dyn ContentKeyStrategy>,
}

impl S3ContentStore {
    /// Build a client from `config` and connect.
    pub async fn connect(config: S3Config) -> BlobResult<Self> {
        let client = Self::create_client(&config).await;
        Ok(Self::from_client(client, config))
    }

    /// Use an existing client.
    pub fn from_client(client: Client, config: S3Config) -> Self {
        Self {
            client,
            config,
            keys: Arc::new(DefaultKeyStrategy),
        }
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn ContentKeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    async fn create_client(config: &S3Config) -> Client {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key_id), Some(secret_access_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id.clone(),
                secret_access_key.clone(),
                None,
                None,
                "dog-blob",
            ));
        }
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url.clone());
        }
        let aws_config = loader.load().await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        )
    }

    fn object_key(&self, owner_id: &str, id: &BlobId) -> String {
        self.config.full_key(&self.keys.object_key(owner_id, id))
    }

    fn map_aws_error(err: impl std::error::Error + Send + Sync + 'static) -> BlobError {
        BlobError::backend(err)
    }

    /// Buffer until at least one part is held; `true` once the source is exhausted.
    async fn fill(&self, stream: &mut ByteStream, buffer: &mut BytesMut) -> BlobResult<bool> {
        while buffer.len() < self.config.part_size {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    async fn put_single(&self, key: &str, body: Bytes, options: &PutOptions) -> BlobResult<()> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .set_content_type(options.media_type.clone())
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        stream: ByteStream,
        buffer: BytesMut,
        ended: bool,
        options: &PutOptions,
    ) -> BlobResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .set_content_type(options.media_type.clone())
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobError::backend(std::io::Error::other("multipart upload has no id")))?
            .to_string();
        debug!(key, upload_id = %upload_id, "multipart upload started");
        let guard = self.abort_on_drop(key, &upload_id);

        let outcome = match self.upload_parts(key, &upload_id, stream, buffer, ended).await {
            Ok(parts) => self.complete_multipart(key, &upload_id, parts).await,
            Err(err) => Err(err),
        };
        guard.disarm();

        if let Err(err) = &outcome {
            warn!(key, upload_id = %upload_id, error = %err, "aborting multipart upload");
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, upload_id = %upload_id, error = %abort_err, "failed to abort multipart upload");
            }
        }
        outcome
    }

    /// Abort the upload in the background if `put_multipart` is dropped mid-flight.
    fn abort_on_drop(&self, key: &str, upload_id: &str) -> AbortOnDrop {
        let client = self.client.clone();
        let bucket = self.config.bucket.clone();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        AbortOnDrop::new(move || {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(key = %key, upload_id = %upload_id, "no runtime left to abort multipart upload");
                return;
            };
            handle.spawn(async move {
                warn!(key = %key, upload_id = %upload_id, "aborting interrupted multipart upload");
                if let Err(err) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, upload_id = %upload_id, error = %err, "failed to abort multipart upload");
                }
            });
        })
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut stream: ByteStream,
        mut buffer: BytesMut,
        mut ended: bool,
    ) -> BlobResult<Vec<CompletedPart>> {
        let part_size = self.config.part_size;
        let mut parts = Vec::new();
        loop {
            while buffer.len() > part_size || (!ended && buffer.len() == part_size) {
                let part = buffer.split_to(part_size).freeze();
                parts.push(self.upload_part(key, upload_id, parts.len() as i32 + 1, part).await?);
            }
            if ended {
                if !buffer.is_empty() {
                    let part = buffer.split().freeze();
                    parts.push(self.upload_part(key, upload_id, parts.len() as i32 + 1, part).await?);
                }
                return Ok(parts);
            }
            ended = self.fill(&mut stream, &mut buffer).await?;
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BlobResult<CompletedPart> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(CompletedPart::builder()
            .set_e_tag(uploaded.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<()> {
        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }

    async fn delete_batch(&self, keys: Vec<String>) -> BlobResult<()> {
        let objects = keys
            .into_iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(Self::map_aws_error)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(Self::map_aws_error)?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.config.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        if let Some(failed) = output.errors().first() {
            return Err(BlobError::backend(std::io::Error::other(format!(
                "failed to delete {} objects, first '{}': {}",
                output.errors().len(),
                failed.key().unwrap_or_default(),
                failed.message().unwrap_or_default()
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for S3ContentStore {
    async fn exists(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool> {
        validate_key(owner_id, id)?;
        let result = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(owner_id, id))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(Self::map_aws_error(err)),
        }
    }

    async fn put(
        &self,
        owner_id: &str,
        id: &BlobId,
        mut stream: ByteStream,
        options: PutOptions,
    ) -> BlobResult<()> {
        validate_key(owner_id, id)?;
        let key = self.object_key(owner_id, id);

        let mut buffer = BytesMut::new();
        let ended = self.fill(&mut stream, &mut buffer).await?;
        if ended && buffer.len() <= self.config.part_size {
            return self.put_single(&key, buffer.freeze(), &options).await;
        }
        self.put_multipart(&key, stream, buffer, ended, &options).await
    }

    async fn get(&self, owner_id: &str, id: &BlobId) -> BlobResult<Option<ByteStream>> {
        validate_key(owner_id, id)?;
        let result = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(owner_id, id))
            .send()
            .await;

        match result {
            Ok(output) => {
                let reader = output.body.into_async_read();
                Ok(Some(Box::pin(ReaderStream::new(reader))))
            }
            Err(err) if err.as_service_error().map_or(false, |e| e.is_no_such_key()) => Ok(None),
            Err(err) => Err(Self::map_aws_error(err)),
        }
    }

    async fn delete(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool> {
        // S3 deletes are idempotent, so existence is checked first.
        if !self.exists(owner_id, id).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(self.object_key(owner_id, id))
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(true)
    }

    async fn delete_all(&self, owner_id: &str) -> BlobResult<()> {
        validate_owner(owner_id)?;
        let prefix = self.config.full_key(&self.keys.owner_prefix(owner_id));

        let mut continuation_token: Option<String> = None;
        let mut deleted = 0usize;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(Self::map_aws_error)?;

            let keys: Vec<String> = page
                .contents()
                .iter()
                .filter_map(|object| object.key().map(str::to_string))
                .collect();
            for batch in keys.chunks(DELETE_BATCH_SIZE) {
                self.delete_batch(batch.to_vec()).await?;
                deleted += batch.len();
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }
        debug!(prefix = %prefix, deleted, "deleted owner content");
        Ok(())
    }
}

/// Runs its abort action when dropped, unless disarmed first.
struct AbortOnDrop {
    abort: Option<Box<dyn FnOnce() + Send>>,
}

impl AbortOnDrop {
    fn new(abort: impl FnOnce() + Send + 'static) -> Self {
        Self {
            abort: Some(Box::new(abort)),
        }
    }

    fn disarm(mut self) {
        self.abort = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::BlobCtx;

    fn flagged_guard() -> (AbortOnDrop, Arc<AtomicBool>) {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = aborted.clone();
        let guard = AbortOnDrop::new(move || flag.store(true, Ordering::SeqCst));
        (guard, aborted)
    }

    #[test]
    fn dropped_guard_aborts() {
        let (guard, aborted) = flagged_guard();
        drop(guard);
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn disarmed_guard_does_not_abort() {
        let (guard, aborted) = flagged_guard();
        guard.disarm();
        assert!(!aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelled_upload_runs_its_abort() {
        let (guard, aborted) = flagged_guard();
        let token = CancellationToken::new();
        let ctx = BlobCtx::new().with_cancellation(token.clone());

        let upload = async move {
            let _guard = guard;
            std::future::pending::<BlobResult<()>>().await
        };
        token.cancel();
        let result = ctx.run(upload).await;

        assert!(matches!(result, Err(BlobError::Cancelled)));
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn prefix_is_joined_once() {
        let config = S3Config::new("bucket").with_prefix("/blobs/");
        assert_eq!(config.full_key("u/a/a"), "blobs/u/a/a");
        assert_eq!(S3Config::new("bucket").full_key("u/a/a"), "u/a/a");
        assert_eq!(S3Config::new("bucket").with_prefix("").full_key("u/"), "u/");
    }

    #[test]
    fn part_size_respects_the_minimum() {
        assert_eq!(S3Config::new("b").part_size, DEFAULT_PART_SIZE);
        assert_eq!(S3Config::new("b").with_part_size(1).part_size, MINIMUM_PART_SIZE);
        assert_eq!(
            S3Config::new("b").with_part_size(16 * 1024 * 1024).part_size,
            16 * 1024 * 1024
        );
    }

    #[test]
    fn from_env_reads_dog_blob_variables() {
        std::env::set_var("DOG_BLOB_S3_BUCKET", "media");
        std::env::set_var("DOG_BLOB_S3_PREFIX", "tenant-a");
        std::env::set_var("DOG_BLOB_S3_ENDPOINT_URL", "http://localhost:9000");
        std::env::set_var("DOG_BLOB_S3_ACCESS_KEY_ID", "key");
        std::env::set_var("DOG_BLOB_S3_SECRET_ACCESS_KEY", "secret");
        std::env::set_var("DOG_BLOB_S3_FORCE_PATH_STYLE", "true");

        let config = S3Config::from_env().unwrap();
        assert_eq!(config.bucket, "media");
        assert_eq!(config.prefix.as_deref(), Some("tenant-a"));
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.access_key_id.as_deref(), Some("key"));
        assert!(config.force_path_style);
        assert_eq!(config.region, "us-east-1");
    }
}
