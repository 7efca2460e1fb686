use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlobError, BlobId, BlobResult};

/// Visibility status of a blob record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobStatus {
    /// Metadata reserved, content not yet verified
    Created,
    /// Content stored and verified; visible to readers
    Available,
}

impl BlobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobStatus::Created => "created",
            BlobStatus::Available => "available",
        }
    }

    pub fn parse(value: &str) -> BlobResult<Self> {
        match value {
            "created" => Ok(BlobStatus::Created),
            "available" => Ok(BlobStatus::Available),
            other => Err(BlobError::invalid(format!("unknown blob status '{}'", other))),
        }
    }
}

impl std::fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft-delete state of a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Liveness {
    #[default]
    Live,
    Tombstoned { deleted_time: DateTime<Utc> },
}

impl Liveness {
    pub fn is_live(&self) -> bool {
        matches!(self, Liveness::Live)
    }

    pub fn deleted_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Liveness::Live => None,
            Liveness::Tombstoned { deleted_time } => Some(*deleted_time),
        }
    }

    pub fn from_deleted_time(deleted_time: Option<DateTime<Utc>>) -> Self {
        deleted_time.map_or(Liveness::Live, |deleted_time| Liveness::Tombstoned { deleted_time })
    }
}

// Persisted as an optional `deletedTime`.
mod deleted_time {
    use super::Liveness;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(liveness: &Liveness, serializer: S) -> Result<S::Ok, S::Error> {
        match liveness {
            Liveness::Live => serializer.serialize_none(),
            Liveness::Tombstoned { deleted_time } => serializer.serialize_some(deleted_time),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Liveness, D::Error> {
        let deleted_time = Option::<DateTime<Utc>>::deserialize(deserializer)?;
        Ok(Liveness::from_deleted_time(deleted_time))
    }
}

/// One structured metadata record per stored blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub id: BlobId,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(rename = "digestMD5", default, skip_serializing_if = "Option::is_none")]
    pub digest_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub status: BlobStatus,
    pub created_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "deletedTime",
        default,
        skip_serializing_if = "Liveness::is_live",
        with = "deleted_time"
    )]
    pub liveness: Liveness,
    /// Records written before revisions existed read back as 0.
    #[serde(default)]
    pub revision: i64,
}

impl Blob {
    /// A freshly reserved record in `created` state.
    pub fn reserve(id: BlobId, user_id: impl Into<String>, create: &BlobCreate) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            media_type: create.media_type.clone(),
            digest_md5: None,
            size: None,
            status: BlobStatus::Created,
            created_time: Utc::now(),
            modified_time: None,
            liveness: Liveness::Live,
            revision: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.liveness.is_live()
    }

    pub fn is_available(&self) -> bool {
        self.status == BlobStatus::Available
    }

    /// Reject patches this record cannot take.
    ///
    /// Digest and size are written once, by the finalize patch.
    pub(crate) fn check_update(&self, update: &BlobUpdate) -> BlobResult<()> {
        if update.sets_content() && (self.digest_md5.is_some() || self.size.is_some()) {
            return Err(BlobError::invalid(format!(
                "blob {} already has a digest and size",
                self.id
            )));
        }
        Ok(())
    }

    /// Apply a sparse patch, bumping the revision.
    pub(crate) fn apply(&mut self, update: &BlobUpdate, now: DateTime<Utc>) {
        if let Some(digest_md5) = &update.digest_md5 {
            self.digest_md5 = Some(digest_md5.clone());
        }
        if let Some(media_type) = &update.media_type {
            self.media_type = Some(media_type.clone());
        }
        if let Some(size) = update.size {
            self.size = Some(size);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        self.modified_time = Some(now);
        self.revision += 1;
    }

    pub(crate) fn tombstone(&mut self, now: DateTime<Utc>) {
        self.liveness = Liveness::Tombstoned { deleted_time: now };
        self.modified_time = Some(now);
        self.revision += 1;
    }
}

/// Filter for blob listings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<BlobStatus>>,
}

impl BlobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media_types<I, S>(mut self, media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media_type = Some(media_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_statuses<I: IntoIterator<Item = BlobStatus>>(mut self, statuses: I) -> Self {
        self.status = Some(statuses.into_iter().collect());
        self
    }

    /// Requested statuses; only `available` when unspecified.
    pub fn statuses(&self) -> Vec<BlobStatus> {
        self.status.clone().unwrap_or_else(|| vec![BlobStatus::Available])
    }

    pub fn validate(&self) -> BlobResult<()> {
        if let Some(media_types) = &self.media_type {
            if media_types.is_empty() {
                return Err(BlobError::invalid("media type filter is empty"));
            }
            for media_type in media_types {
                validate_media_type(media_type)?;
            }
        }
        if let Some(statuses) = &self.status {
            if statuses.is_empty() {
                return Err(BlobError::invalid("status filter is empty"));
            }
        }
        Ok(())
    }

    /// Whether a live record satisfies this filter.
    pub fn matches(&self, blob: &Blob) -> bool {
        if !blob.is_live() || !self.statuses().contains(&blob.status) {
            return false;
        }
        match (&self.media_type, &blob.media_type) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted.iter().any(|m| m == actual),
            (Some(_), None) => false,
        }
    }
}

/// Fields supplied when reserving a record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobCreate {
    pub media_type: Option<String>,
}

impl BlobCreate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media_type<S: Into<String>>(mut self, media_type: S) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        self.media_type.as_deref().map_or(Ok(()), validate_media_type)
    }
}

/// Sparse patch applied by `update`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobUpdate {
    pub digest_md5: Option<String>,
    pub media_type: Option<String>,
    pub size: Option<u64>,
    pub status: Option<BlobStatus>,
}

impl BlobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The finalize patch that makes a blob visible.
    pub fn finalize(digest_md5: String, size: u64) -> Self {
        Self {
            digest_md5: Some(digest_md5),
            media_type: None,
            size: Some(size),
            status: Some(BlobStatus::Available),
        }
    }

    pub fn with_media_type<S: Into<String>>(mut self, media_type: S) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn with_status(mut self, status: BlobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.digest_md5.is_none()
            && self.media_type.is_none()
            && self.size.is_none()
            && self.status.is_none()
    }

    pub(crate) fn sets_content(&self) -> bool {
        self.digest_md5.is_some() || self.size.is_some()
    }

    pub fn validate(&self) -> BlobResult<()> {
        if let Some(digest_md5) = &self.digest_md5 {
            validate_digest_md5(digest_md5)?;
        }
        if let Some(media_type) = &self.media_type {
            validate_media_type(media_type)?;
        }
        validate_content_pair(self.digest_md5.as_deref(), self.size)
    }
}

/// Digest and size describe the same bytes, so a patch carries both or neither.
pub(crate) fn validate_content_pair(digest_md5: Option<&str>, size: Option<u64>) -> BlobResult<()> {
    if digest_md5.is_some() != size.is_some() {
        return Err(BlobError::invalid("digest and size must be set together"));
    }
    Ok(())
}

/// Accepts `type/subtype` with optional `; parameter` suffixes.
pub fn validate_media_type(media_type: &str) -> BlobResult<()> {
    let essence = media_type.split(';').next().unwrap_or_default().trim();
    let valid = essence
        .split_once('/')
        .map_or(false, |(kind, subtype)| is_restricted_name(kind) && is_restricted_name(subtype));
    if !valid {
        return Err(BlobError::invalid(format!("media type '{}' is invalid", media_type)));
    }
    Ok(())
}

fn is_restricted_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    name.len() <= 127
        && chars.all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
}

/// A digest is the standard base64 encoding of exactly 16 MD5 bytes.
pub fn validate_digest_md5(digest_md5: &str) -> BlobResult<()> {
    match base64::engine::general_purpose::STANDARD.decode(digest_md5) {
        Ok(bytes) if bytes.len() == 16 => Ok(()),
        _ => Err(BlobError::invalid(format!("digest '{}' is not a base64 MD5", digest_md5))),
    }
}
