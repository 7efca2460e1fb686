use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};

use crate::config::GET_MANY_CONCURRENCY;
use crate::types::validate_user_id;
use crate::{BlobError, BlobId, BlobResult, ByteStream};

/// Raw content storage keyed by `(owner, blob id)` - implemented by all content backends
///
/// A content store knows nothing about metadata. It never enforces size
/// limits or verifies digests; the orchestration client does both.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Whether an object exists for the key
    async fn exists(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool>;

    /// Store content from a stream
    async fn put(
        &self,
        owner_id: &str,
        id: &BlobId,
        stream: ByteStream,
        options: PutOptions,
    ) -> BlobResult<()>;

    /// Open content as a stream; `None` when the object is absent
    async fn get(&self, owner_id: &str, id: &BlobId) -> BlobResult<Option<ByteStream>>;

    /// Open several objects, in input order, with bounded concurrency.
    ///
    /// The first failure is returned and the remaining fetches are dropped.
    /// An absent object counts as a failure.
    async fn get_many(&self, owner_id: &str, ids: &[BlobId]) -> BlobResult<Vec<ByteStream>> {
        get_many_buffered(self, owner_id, ids, GET_MANY_CONCURRENCY).await
    }

    /// Delete an object; reports whether it existed
    async fn delete(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool>;

    /// Delete every object stored for an owner
    async fn delete_all(&self, owner_id: &str) -> BlobResult<()>;
}

/// Fetch `ids` from `store` keeping at most `concurrency` gets in flight.
pub async fn get_many_buffered<S>(
    store: &S,
    owner_id: &str,
    ids: &[BlobId],
    concurrency: usize,
) -> BlobResult<Vec<ByteStream>>
where
    S: ContentStore + ?Sized,
{
    futures::stream::iter(ids.to_vec())
        .map(move |id: BlobId| async move {
            store
                .get(owner_id, &id)
                .await?
                .ok_or_else(|| BlobError::not_found(id.as_str()))
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Options for a content put
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub media_type: Option<String>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media_type(media_type: Option<String>) -> Self {
        Self { media_type }
    }
}

/// Strategy for deriving object keys
pub trait ContentKeyStrategy: Send + Sync {
    /// Key of the object holding a blob's content
    fn object_key(&self, owner_id: &str, id: &BlobId) -> String;

    /// Prefix shared by every object of one owner
    fn owner_prefix(&self, owner_id: &str) -> String {
        format!("{}/", owner_id)
    }
}

/// Default key strategy: owner/id/id
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyStrategy;

impl ContentKeyStrategy for DefaultKeyStrategy {
    fn object_key(&self, owner_id: &str, id: &BlobId) -> String {
        format!("{}/{}/{}", owner_id, id, id)
    }
}

/// Flat key strategy: owner/id
#[derive(Debug, Clone, Default)]
pub struct FlatKeyStrategy;

impl ContentKeyStrategy for FlatKeyStrategy {
    fn object_key(&self, owner_id: &str, id: &BlobId) -> String {
        format!("{}/{}", owner_id, id)
    }
}

/// Owners become key prefixes, so they may not contain the separator.
pub(crate) fn validate_owner(owner_id: &str) -> BlobResult<()> {
    validate_user_id(owner_id)?;
    if owner_id.contains('/') {
        return Err(BlobError::invalid(format!(
            "owner id '{}' contains '/'",
            owner_id
        )));
    }
    Ok(())
}

pub(crate) fn validate_key(owner_id: &str, id: &BlobId) -> BlobResult<()> {
    validate_owner(owner_id)?;
    id.validate()?;
    if id.as_str().contains('/') {
        return Err(BlobError::invalid(format!("blob id '{}' contains '/'", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::bytes_stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Serves every id after a short delay, tracking how many gets overlap.
    #[derive(Default)]
    struct CountingStore {
        failing: Option<BlobId>,
        started: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ContentStore for CountingStore {
        async fn exists(&self, _owner_id: &str, _id: &BlobId) -> BlobResult<bool> {
            Ok(true)
        }

        async fn put(
            &self,
            _owner_id: &str,
            _id: &BlobId,
            _stream: ByteStream,
            _options: PutOptions,
        ) -> BlobResult<()> {
            Ok(())
        }

        async fn get(&self, _owner_id: &str, id: &BlobId) -> BlobResult<Option<ByteStream>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.failing.as_ref() == Some(id) {
                return Err(BlobError::backend(std::io::Error::other("unreachable")));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(bytes_stream(id.as_str().to_string())))
        }

        async fn delete(&self, _owner_id: &str, _id: &BlobId) -> BlobResult<bool> {
            Ok(true)
        }

        async fn delete_all(&self, _owner_id: &str) -> BlobResult<()> {
            Ok(())
        }
    }

    fn ids(count: usize) -> Vec<BlobId> {
        (0..count).map(|_| BlobId::new()).collect()
    }

    #[tokio::test]
    async fn get_many_caps_fetches_in_flight() {
        let store = CountingStore::default();
        let ids = ids(12);

        let streams = store.get_many("user-1", &ids).await.unwrap();

        assert_eq!(streams.len(), 12);
        assert_eq!(store.started.load(Ordering::SeqCst), 12);
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), GET_MANY_CONCURRENCY);
    }

    #[tokio::test]
    async fn get_many_keeps_input_order() {
        let store = CountingStore::default();
        let ids = ids(6);

        let streams = get_many_buffered(&store, "user-1", &ids, 3).await.unwrap();
        for (id, stream) in ids.iter().zip(streams) {
            let body = crate::testing::read_to_end(stream).await.unwrap();
            assert_eq!(body, id.as_str().as_bytes());
        }
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn get_many_stops_at_first_failure() {
        let ids = ids(12);
        let store = CountingStore {
            failing: Some(ids[0].clone()),
            ..CountingStore::default()
        };

        let result = store.get_many("user-1", &ids).await;

        assert!(matches!(result, Err(BlobError::Backend { .. })));
        let started = store.started.load(Ordering::SeqCst);
        assert!(
            started <= GET_MANY_CONCURRENCY,
            "{} gets started after the first failure",
            started
        );
    }

    #[test]
    fn default_key_repeats_the_id() {
        let id = BlobId::from("abc");
        assert_eq!(DefaultKeyStrategy.object_key("user-1", &id), "user-1/abc/abc");
        assert_eq!(DefaultKeyStrategy.owner_prefix("user-1"), "user-1/");
    }

    #[test]
    fn flat_key() {
        let id = BlobId::from("abc");
        assert_eq!(FlatKeyStrategy.object_key("user-1", &id), "user-1/abc");
    }

    #[test]
    fn keys_are_validated() {
        assert!(validate_key("user-1", &BlobId::from("abc")).is_ok());
        assert!(validate_key("", &BlobId::from("abc")).is_err());
        assert!(validate_key("a/b", &BlobId::from("abc")).is_err());
        assert!(validate_key("user-1", &BlobId::from("")).is_err());
        assert!(validate_key("user-1", &BlobId::from("x/y")).is_err());
    }
}
