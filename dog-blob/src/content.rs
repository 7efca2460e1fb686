use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::blob::{validate_digest_md5, validate_media_type};
use crate::device_logs::{validate_time_range, DeviceLogsBlob};
use crate::{BlobResult, ByteStream};

/// Wrap an in-memory buffer as a single-chunk `ByteStream`.
pub fn bytes_stream<B: Into<Bytes>>(bytes: B) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

/// Content supplied to `BlobClient::create`
pub struct BlobContent {
    pub body: ByteStream,
    /// Expected base64 MD5; verified against what was actually stored.
    pub digest_md5: Option<String>,
    pub media_type: Option<String>,
}

impl BlobContent {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            digest_md5: None,
            media_type: None,
        }
    }

    pub fn from_bytes<B: Into<Bytes>>(bytes: B) -> Self {
        Self::new(bytes_stream(bytes))
    }

    pub fn with_digest_md5<S: Into<String>>(mut self, digest_md5: S) -> Self {
        self.digest_md5 = Some(digest_md5.into());
        self
    }

    pub fn with_media_type<S: Into<String>>(mut self, media_type: S) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        if let Some(digest_md5) = &self.digest_md5 {
            validate_digest_md5(digest_md5)?;
        }
        if let Some(media_type) = &self.media_type {
            validate_media_type(media_type)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlobContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobContent")
            .field("digest_md5", &self.digest_md5)
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

/// Content supplied to `DeviceLogsClient::create`
pub struct DeviceLogsContent {
    pub body: ByteStream,
    pub digest_md5: Option<String>,
    pub media_type: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl DeviceLogsContent {
    pub fn new(body: ByteStream, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        Self {
            body,
            digest_md5: None,
            media_type: None,
            start_at,
            end_at,
        }
    }

    pub fn with_digest_md5<S: Into<String>>(mut self, digest_md5: S) -> Self {
        self.digest_md5 = Some(digest_md5.into());
        self
    }

    pub fn with_media_type<S: Into<String>>(mut self, media_type: S) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        if let Some(digest_md5) = &self.digest_md5 {
            validate_digest_md5(digest_md5)?;
        }
        if let Some(media_type) = &self.media_type {
            validate_media_type(media_type)?;
        }
        validate_time_range(Some(self.start_at), Some(self.end_at))
    }
}

impl std::fmt::Debug for DeviceLogsContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLogsContent")
            .field("digest_md5", &self.digest_md5)
            .field("media_type", &self.media_type)
            .field("start_at", &self.start_at)
            .field("end_at", &self.end_at)
            .finish_non_exhaustive()
    }
}

/// Result of opening a blob for reading
pub struct OpenedContent {
    pub stream: ByteStream,
    pub digest_md5: Option<String>,
    pub media_type: Option<String>,
    pub size: Option<u64>,
}

/// A device-logs record paired with its content
pub struct OpenedDeviceLogs {
    pub blob: DeviceLogsBlob,
    pub stream: ByteStream,
}
