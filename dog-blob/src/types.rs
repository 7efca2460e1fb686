use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{BlobError, BlobResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Largest page a listing may request.
pub const PAGINATION_SIZE_MAXIMUM: u32 = 100;

/// Unique identifier for a blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl BlobId {
    /// Generate a new random blob ID (32 lowercase hex characters)
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn validate(&self) -> BlobResult<()> {
        if self.0.trim().is_empty() {
            return Err(BlobError::invalid("blob id is empty"));
        }
        Ok(())
    }
}

impl Default for BlobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Context for blob operations (request identity and cancellation)
#[derive(Debug, Clone)]
pub struct BlobCtx {
    pub request_id: String,
    cancellation: CancellationToken,
}

impl BlobCtx {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = request_id;
        self
    }

    /// Tie this context to a caller-owned token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drive `fut` to completion unless the context is cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> BlobResult<T>
    where
        F: Future<Output = BlobResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(BlobError::Cancelled),
            result = fut => result,
        }
    }
}

impl Default for BlobCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Precondition on a metadata mutation or read.
///
/// A `revision` that does not match the stored one turns the operation into
/// a no-op (`None` / `false`), never an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_revision(revision: i64) -> Self {
        Self {
            revision: Some(revision),
        }
    }

    pub(crate) fn validate(&self) -> BlobResult<()> {
        match self.revision {
            Some(revision) if revision < 0 => Err(BlobError::invalid(format!(
                "condition revision {} is negative",
                revision
            ))),
            _ => Ok(()),
        }
    }

    /// Whether a record at `revision` satisfies this condition.
    pub fn matches(&self, revision: i64) -> bool {
        self.revision.map_or(true, |expected| expected == revision)
    }
}

/// Shorthand for an optional condition.
pub(crate) fn condition_matches(condition: Option<&Condition>, revision: i64) -> bool {
    condition.map_or(true, |c| c.matches(revision))
}

pub(crate) fn validate_condition(condition: Option<&Condition>) -> BlobResult<()> {
    condition.map_or(Ok(()), Condition::validate)
}

/// Page/size pagination for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 0,
            size: PAGINATION_SIZE_MAXIMUM,
        }
    }
}

impl Pagination {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn validate(&self) -> BlobResult<()> {
        if self.size == 0 || self.size > PAGINATION_SIZE_MAXIMUM {
            return Err(BlobError::invalid(format!(
                "pagination size {} is not between 1 and {}",
                self.size, PAGINATION_SIZE_MAXIMUM
            )));
        }
        Ok(())
    }

    /// Number of records to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    /// Slice an already-sorted listing down to this page.
    pub(crate) fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset() as usize)
            .take(self.size as usize)
            .collect()
    }
}

pub(crate) fn validate_user_id(user_id: &str) -> BlobResult<()> {
    if user_id.trim().is_empty() {
        return Err(BlobError::invalid("user id is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = BlobId::new();
        let b = BlobId::new();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn pagination_bounds() {
        assert_ok!(Pagination::default().validate());
        assert_ok!(Pagination::new(0, 1).validate());
        assert_ok!(Pagination::new(3, 100).validate());
        assert_err!(Pagination::new(0, 0).validate());
        assert_err!(Pagination::new(0, 101).validate());
        assert_eq!(Pagination::new(2, 10).offset(), 20);
        assert_eq!(Pagination::new(1, 2).apply(vec![1, 2, 3, 4, 5]), vec![3, 4]);
    }

    #[test]
    fn condition_matching() {
        assert!(Condition::new().matches(7));
        assert!(Condition::with_revision(7).matches(7));
        assert!(!Condition::with_revision(6).matches(7));
        assert!(condition_matches(None, 3));
        assert!(Condition::with_revision(-1).validate().is_err());
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let token = CancellationToken::new();
        let ctx = BlobCtx::new().with_cancellation(token.clone());
        token.cancel();

        let result = ctx.run(std::future::pending::<BlobResult<()>>()).await;
        assert!(matches!(result, Err(BlobError::Cancelled)));
    }

    #[tokio::test]
    async fn live_context_runs_future() {
        let ctx = BlobCtx::new();
        let value = assert_ok!(ctx.run(async { Ok::<_, BlobError>(5) }).await);
        assert_eq!(value, 5);
    }
}
