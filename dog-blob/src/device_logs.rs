use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::{validate_content_pair, validate_digest_md5, validate_media_type};
use crate::{BlobError, BlobId, BlobResult};

/// Metadata for a device-logs blob; the content covers `[start_at_time, end_at_time]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLogsBlob {
    pub id: BlobId,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(rename = "digestMD5", default, skip_serializing_if = "Option::is_none")]
    pub digest_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at_time: Option<DateTime<Utc>>,
    pub created_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: i64,
}

impl DeviceLogsBlob {
    pub fn reserve(id: BlobId, user_id: impl Into<String>, create: &DeviceLogsCreate) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            media_type: create.media_type.clone(),
            digest_md5: None,
            size: None,
            start_at_time: None,
            end_at_time: None,
            created_time: Utc::now(),
            modified_time: None,
            revision: 0,
        }
    }

    /// Finalized records carry their time range.
    pub fn is_finalized(&self) -> bool {
        self.start_at_time.is_some() && self.end_at_time.is_some()
    }

    /// Reject patches this record cannot take: a second digest/size, or a
    /// range that would end before it starts once merged with stored times.
    pub(crate) fn check_update(&self, update: &DeviceLogsUpdate) -> BlobResult<()> {
        if update.sets_content() && (self.digest_md5.is_some() || self.size.is_some()) {
            return Err(BlobError::invalid(format!(
                "device logs {} already have a digest and size",
                self.id
            )));
        }
        validate_time_range(
            update.start_at_time.or(self.start_at_time),
            update.end_at_time.or(self.end_at_time),
        )
    }

    pub(crate) fn apply(&mut self, update: &DeviceLogsUpdate, now: DateTime<Utc>) {
        if let Some(digest_md5) = &update.digest_md5 {
            self.digest_md5 = Some(digest_md5.clone());
        }
        if let Some(media_type) = &update.media_type {
            self.media_type = Some(media_type.clone());
        }
        if let Some(size) = update.size {
            self.size = Some(size);
        }
        if let Some(start_at_time) = update.start_at_time {
            self.start_at_time = Some(start_at_time);
        }
        if let Some(end_at_time) = update.end_at_time {
            self.end_at_time = Some(end_at_time);
        }
        self.modified_time = Some(now);
        self.revision += 1;
    }
}

/// Time-window filter for device-logs listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLogsFilter {
    /// Inclusive lower bound on `start_at_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `end_at_time`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at_time: Option<DateTime<Utc>>,
}

impl DeviceLogsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(mut self, start_at_time: DateTime<Utc>) -> Self {
        self.start_at_time = Some(start_at_time);
        self
    }

    pub fn ending_before(mut self, end_at_time: DateTime<Utc>) -> Self {
        self.end_at_time = Some(end_at_time);
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        validate_time_range(self.start_at_time, self.end_at_time)
    }

    pub fn matches(&self, blob: &DeviceLogsBlob) -> bool {
        let (Some(start), Some(end)) = (blob.start_at_time, blob.end_at_time) else {
            return false;
        };
        self.start_at_time.map_or(true, |lower| start >= lower)
            && self.end_at_time.map_or(true, |upper| end < upper)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLogsCreate {
    pub media_type: Option<String>,
}

impl DeviceLogsCreate {
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

/// Sparse patch for a device-logs record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLogsUpdate {
    pub digest_md5: Option<String>,
    pub media_type: Option<String>,
    pub size: Option<u64>,
    pub start_at_time: Option<DateTime<Utc>>,
    pub end_at_time: Option<DateTime<Utc>>,
}

impl DeviceLogsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.digest_md5.is_none()
            && self.media_type.is_none()
            && self.size.is_none()
            && self.start_at_time.is_none()
            && self.end_at_time.is_none()
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
        validate_content_pair(self.digest_md5.as_deref(), self.size)?;
        validate_time_range(self.start_at_time, self.end_at_time)
    }
}

pub(crate) fn validate_time_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> BlobResult<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(BlobError::invalid(format!(
            "start time {} is after end time {}",
            start.to_rfc3339(),
            end.to_rfc3339()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn finalized(start: u32, end: u32) -> DeviceLogsBlob {
        let mut blob = DeviceLogsBlob::reserve(BlobId::new(), "user-1", &DeviceLogsCreate::new());
        blob.apply(
            &DeviceLogsUpdate {
                start_at_time: Some(at(start)),
                end_at_time: Some(at(end)),
                ..DeviceLogsUpdate::new()
            },
            Utc::now(),
        );
        blob
    }

    #[test]
    fn filter_bounds_are_inclusive_then_exclusive() {
        let blob = finalized(2, 4);
        assert!(DeviceLogsFilter::new().matches(&blob));
        assert!(DeviceLogsFilter::new().starting_at(at(2)).matches(&blob));
        assert!(!DeviceLogsFilter::new().starting_at(at(3)).matches(&blob));
        assert!(DeviceLogsFilter::new().ending_before(at(5)).matches(&blob));
        assert!(!DeviceLogsFilter::new().ending_before(at(4)).matches(&blob));
    }

    #[test]
    fn unfinalized_records_never_match() {
        let blob = DeviceLogsBlob::reserve(BlobId::new(), "user-1", &DeviceLogsCreate::new());
        assert!(!blob.is_finalized());
        assert!(!DeviceLogsFilter::new().matches(&blob));
    }

    #[test]
    fn inverted_range_is_invalid() {
        assert!(DeviceLogsFilter::new()
            .starting_at(at(5))
            .ending_before(at(1))
            .validate()
            .is_err());
        let update = DeviceLogsUpdate {
            start_at_time: Some(at(3)),
            end_at_time: Some(at(3)),
            ..DeviceLogsUpdate::new()
        };
        assert!(update.validate().is_ok());
    }

    #[test]
    fn merged_range_must_not_invert() {
        let blob = finalized(5, 6);
        let earlier_end = DeviceLogsUpdate {
            end_at_time: Some(at(1)),
            ..DeviceLogsUpdate::new()
        };
        assert!(earlier_end.validate().is_ok());
        assert!(matches!(
            blob.check_update(&earlier_end),
            Err(BlobError::Invalid { .. })
        ));

        let later_start = DeviceLogsUpdate {
            start_at_time: Some(at(7)),
            ..DeviceLogsUpdate::new()
        };
        assert!(blob.check_update(&later_start).is_err());

        let widened = DeviceLogsUpdate {
            end_at_time: Some(at(8)),
            ..DeviceLogsUpdate::new()
        };
        assert!(blob.check_update(&widened).is_ok());
    }

    #[test]
    fn content_fields_are_written_once() {
        let mut blob = finalized(1, 2);
        let content = DeviceLogsUpdate {
            digest_md5: Some("1B2M2Y8AsgTpgAmY7PhCfg==".into()),
            size: Some(0),
            ..DeviceLogsUpdate::new()
        };
        assert!(blob.check_update(&content).is_ok());
        blob.apply(&content, Utc::now());
        assert!(blob.check_update(&content).is_err());

        let size_only = DeviceLogsUpdate {
            size: Some(1),
            ..DeviceLogsUpdate::new()
        };
        assert!(size_only.validate().is_err());
    }

    #[test]
    fn persisted_shape() {
        let blob = finalized(1, 2);
        let doc = serde_json::to_value(&blob).unwrap();
        assert!(doc.get("startAtTime").is_some());
        assert!(doc.get("endAtTime").is_some());
        assert!(doc.get("status").is_none());
        assert_eq!(doc["revision"], serde_json::json!(1));
    }
}
