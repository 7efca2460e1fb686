//! Backend conformance suites.
//!
//! Every repository and content store implementation runs the same checks.
//! Each check works under its own random owner, so the suites can run
//! against a shared database.

use chrono::{Duration, TimeZone, Utc};
use futures::StreamExt;

use crate::content::bytes_stream;
use crate::repository::{BlobRepository, DeviceLogsRepository};
use crate::store::{ContentStore, PutOptions};
use crate::{
    BlobCreate, BlobError, BlobFilter, BlobId, BlobResult, BlobStatus, BlobUpdate, ByteStream,
    Condition, DeviceLogsCreate, DeviceLogsFilter, DeviceLogsUpdate, Pagination,
};

const DIGEST_EMPTY: &str = "1B2M2Y8AsgTpgAmY7PhCfg==";
const DIGEST_HELLO: &str = "XUFAKrxLKna5cZ2REBfFkg==";

fn missing(what: &str) -> BlobError {
    BlobError::not_found(format!("conformance: {}", what))
}

fn fresh_user() -> String {
    format!("conformance-{}", BlobId::new())
}

/// Drain a content stream into memory.
pub async fn read_to_end(mut stream: ByteStream) -> BlobResult<Vec<u8>> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer)
}

/// Run the blob repository conformance suite.
///
/// # Errors
///
/// Returns an error if the backend fails; assertion failures panic.
pub async fn run_blob_repository_conformance(repository: &dyn BlobRepository) -> BlobResult<()> {
    test_blob_create_and_get(repository).await?;
    test_blob_update_is_conditional(repository).await?;
    test_blob_content_is_written_once(repository).await?;
    test_blob_delete_tombstones(repository).await?;
    test_blob_list_filters_and_sorts(repository).await?;
    test_blob_bulk_delete_and_destroy(repository).await?;
    test_blob_input_validation(repository).await?;
    Ok(())
}

async fn test_blob_create_and_get(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository
        .create(&user, &BlobCreate::new().with_media_type("image/png"))
        .await?;
    assert_eq!(blob.user_id, user);
    assert_eq!(blob.status, BlobStatus::Created);
    assert_eq!(blob.revision, 0);
    assert_eq!(blob.media_type.as_deref(), Some("image/png"));
    assert!(blob.digest_md5.is_none() && blob.size.is_none());
    assert!(blob.is_live());

    let fetched = repository.get(&blob.id, None).await?;
    assert_eq!(fetched.as_ref().map(|b| &b.id), Some(&blob.id));

    let current = repository.get(&blob.id, Some(&Condition::with_revision(0))).await?;
    assert!(current.is_some(), "matching revision should read");
    let stale = repository.get(&blob.id, Some(&Condition::with_revision(1))).await?;
    assert!(stale.is_none(), "mismatching revision should read as absent");

    let unknown = repository.get(&BlobId::new(), None).await?;
    assert!(unknown.is_none(), "unknown id should read as absent");
    Ok(())
}

async fn test_blob_update_is_conditional(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository.create(&user, &BlobCreate::new()).await?;

    let finalized = repository
        .update(
            &blob.id,
            Some(&Condition::with_revision(0)),
            &BlobUpdate::finalize(DIGEST_HELLO.to_string(), 5),
        )
        .await?
        .ok_or_else(|| missing("finalize should match revision 0"))?;
    assert_eq!(finalized.revision, 1);
    assert_eq!(finalized.status, BlobStatus::Available);
    assert_eq!(finalized.digest_md5.as_deref(), Some(DIGEST_HELLO));
    assert_eq!(finalized.size, Some(5));
    assert!(finalized.modified_time.is_some());

    let stale = repository
        .update(
            &blob.id,
            Some(&Condition::with_revision(0)),
            &BlobUpdate::new().with_media_type("text/plain"),
        )
        .await?;
    assert!(stale.is_none(), "stale revision should not match");
    let unchanged = repository.get(&blob.id, None).await?.ok_or_else(|| missing("record exists"))?;
    assert_eq!(unchanged.revision, 1);
    assert!(unchanged.media_type.is_none());

    let unconditional = repository
        .update(&blob.id, None, &BlobUpdate::new().with_media_type("text/plain"))
        .await?
        .ok_or_else(|| missing("unconditional update should match"))?;
    assert_eq!(unconditional.revision, 2);
    assert_eq!(unconditional.media_type.as_deref(), Some("text/plain"));

    let read = repository
        .update(&blob.id, None, &BlobUpdate::new())
        .await?
        .ok_or_else(|| missing("empty update reads the record"))?;
    assert_eq!(read.revision, 2, "empty update should not bump the revision");

    let unknown = repository
        .update(&BlobId::new(), None, &BlobUpdate::new().with_media_type("text/plain"))
        .await?;
    assert!(unknown.is_none());
    Ok(())
}

async fn test_blob_content_is_written_once(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository.create(&user, &BlobCreate::new()).await?;

    let half = BlobUpdate {
        size: Some(5),
        ..BlobUpdate::new()
    };
    assert!(matches!(
        repository.update(&blob.id, None, &half).await,
        Err(BlobError::Invalid { .. })
    ));

    repository
        .update(&blob.id, None, &BlobUpdate::finalize(DIGEST_HELLO.to_string(), 5))
        .await?
        .ok_or_else(|| missing("first finalize"))?;
    let second = repository
        .update(&blob.id, None, &BlobUpdate::finalize(DIGEST_EMPTY.to_string(), 0))
        .await;
    assert!(matches!(second, Err(BlobError::Invalid { .. })));

    let stored = repository.get(&blob.id, None).await?.ok_or_else(|| missing("finalized"))?;
    assert_eq!(stored.digest_md5.as_deref(), Some(DIGEST_HELLO));
    assert_eq!(stored.size, Some(5));
    assert_eq!(stored.revision, 1);
    repository.destroy_all(&user).await?;
    Ok(())
}

async fn test_blob_delete_tombstones(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository.create(&user, &BlobCreate::new()).await?;

    assert!(
        !repository.delete(&blob.id, Some(&Condition::with_revision(3))).await?,
        "stale delete should not match"
    );
    assert!(repository.delete(&blob.id, Some(&Condition::with_revision(0))).await?);
    assert!(repository.get(&blob.id, None).await?.is_none());
    assert!(
        repository
            .update(&blob.id, None, &BlobUpdate::new().with_media_type("text/plain"))
            .await?
            .is_none(),
        "tombstoned records are not updatable"
    );
    assert!(!repository.delete(&blob.id, None).await?, "second delete is a no-op");

    // Tombstone bumped the revision to 1.
    assert!(!repository.destroy(&blob.id, Some(&Condition::with_revision(0))).await?);
    assert!(repository.destroy(&blob.id, Some(&Condition::with_revision(1))).await?);
    assert!(!repository.destroy(&blob.id, None).await?);

    let never_deleted = repository.create(&user, &BlobCreate::new()).await?;
    assert!(repository.destroy(&never_deleted.id, None).await?);
    assert!(repository.get(&never_deleted.id, None).await?.is_none());
    Ok(())
}

async fn test_blob_list_filters_and_sorts(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let other = fresh_user();

    let mut available = Vec::new();
    for media_type in ["image/png", "text/plain", "image/png"] {
        let blob = repository
            .create(&user, &BlobCreate::new().with_media_type(media_type))
            .await?;
        repository
            .update(&blob.id, None, &BlobUpdate::finalize(DIGEST_EMPTY.to_string(), 0))
            .await?;
        available.push(blob.id);
    }
    let pending = repository.create(&user, &BlobCreate::new()).await?;
    let removed = repository.create(&user, &BlobCreate::new()).await?;
    repository
        .update(&removed.id, None, &BlobUpdate::finalize(DIGEST_EMPTY.to_string(), 0))
        .await?;
    repository.delete(&removed.id, None).await?;
    repository.create(&other, &BlobCreate::new()).await?;

    let ids = |blobs: Vec<crate::Blob>| blobs.into_iter().map(|b| b.id).collect::<Vec<_>>();
    let newest_first: Vec<BlobId> = available.iter().rev().cloned().collect();

    let listed = repository
        .list(&user, &BlobFilter::new(), &Pagination::default())
        .await?;
    assert_eq!(ids(listed), newest_first, "default lists available, newest first");

    let pngs = repository
        .list(
            &user,
            &BlobFilter::new().with_media_types(["image/png"]),
            &Pagination::default(),
        )
        .await?;
    assert_eq!(ids(pngs), vec![available[2].clone(), available[0].clone()]);

    let created = repository
        .list(
            &user,
            &BlobFilter::new().with_statuses([BlobStatus::Created]),
            &Pagination::default(),
        )
        .await?;
    assert_eq!(ids(created), vec![pending.id.clone()]);

    let everything = repository
        .list(
            &user,
            &BlobFilter::new().with_statuses([BlobStatus::Created, BlobStatus::Available]),
            &Pagination::default(),
        )
        .await?;
    assert_eq!(everything.len(), 4, "tombstones never list");

    let second_page = repository
        .list(&user, &BlobFilter::new(), &Pagination::new(1, 2))
        .await?;
    assert_eq!(ids(second_page), vec![available[0].clone()]);

    let past_end = repository
        .list(&user, &BlobFilter::new(), &Pagination::new(5, 2))
        .await?;
    assert!(past_end.is_empty());
    Ok(())
}

async fn test_blob_bulk_delete_and_destroy(repository: &dyn BlobRepository) -> BlobResult<()> {
    let user = fresh_user();
    let bystander = fresh_user();
    assert!(!repository.delete_all(&user).await?, "nothing to delete yet");

    let first = repository.create(&user, &BlobCreate::new()).await?;
    let second = repository.create(&user, &BlobCreate::new()).await?;
    let kept = repository.create(&bystander, &BlobCreate::new()).await?;

    assert!(repository.delete_all(&user).await?);
    assert!(repository.get(&first.id, None).await?.is_none());
    assert!(repository.get(&second.id, None).await?.is_none());
    assert!(!repository.delete_all(&user).await?, "tombstones do not match again");

    assert!(repository.destroy_all(&user).await?);
    assert!(!repository.destroy_all(&user).await?);
    assert!(!repository.destroy(&first.id, None).await?, "already destroyed");
    assert!(repository.get(&kept.id, None).await?.is_some());
    Ok(())
}

async fn test_blob_input_validation(repository: &dyn BlobRepository) -> BlobResult<()> {
    fn is_invalid<T>(result: BlobResult<T>) -> bool {
        matches!(result, Err(BlobError::Invalid { .. }))
    }

    let user = fresh_user();
    assert!(is_invalid(repository.create("", &BlobCreate::new()).await));
    assert!(is_invalid(
        repository
            .create(&user, &BlobCreate::new().with_media_type("png"))
            .await
    ));
    assert!(is_invalid(repository.get(&BlobId::from(""), None).await));
    assert!(is_invalid(
        repository
            .list(&user, &BlobFilter::new(), &Pagination::new(0, 0))
            .await
    ));
    assert!(is_invalid(
        repository
            .list(&user, &BlobFilter::new().with_statuses([]), &Pagination::default())
            .await
    ));
    let patch = BlobUpdate {
        digest_md5: Some("short".to_string()),
        ..BlobUpdate::new()
    };
    assert!(is_invalid(repository.update(&BlobId::new(), None, &patch).await));
    assert!(is_invalid(
        repository
            .delete(&BlobId::new(), Some(&Condition::with_revision(-1)))
            .await
    ));
    Ok(())
}

/// Run the device-logs repository conformance suite.
///
/// # Errors
///
/// Returns an error if the backend fails; assertion failures panic.
pub async fn run_device_logs_repository_conformance(
    repository: &dyn DeviceLogsRepository,
) -> BlobResult<()> {
    test_device_logs_lifecycle(repository).await?;
    test_device_logs_list_window(repository).await?;
    test_device_logs_range_stays_ordered(repository).await?;
    test_device_logs_input_validation(repository).await?;
    Ok(())
}

fn hour(h: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
        + Duration::hours(i64::from(h))
}

fn window(start: u32, end: u32) -> DeviceLogsUpdate {
    DeviceLogsUpdate {
        digest_md5: Some(DIGEST_EMPTY.to_string()),
        size: Some(0),
        start_at_time: Some(hour(start)),
        end_at_time: Some(hour(end)),
        ..DeviceLogsUpdate::new()
    }
}

async fn test_device_logs_lifecycle(repository: &dyn DeviceLogsRepository) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository
        .create(&user, &DeviceLogsCreate::new().with_media_type("application/json"))
        .await?;
    assert_eq!(blob.revision, 0);
    assert!(!blob.is_finalized());

    let fetched = repository.get(&blob.id).await?.ok_or_else(|| missing("plain lookup by id"))?;
    assert_eq!(fetched.user_id, user);

    let stale = repository
        .update(&blob.id, Some(&Condition::with_revision(4)), &window(1, 2))
        .await?;
    assert!(stale.is_none());

    let finalized = repository
        .update(&blob.id, Some(&Condition::with_revision(0)), &window(1, 2))
        .await?
        .ok_or_else(|| missing("finalize should match"))?;
    assert!(finalized.is_finalized());
    assert_eq!(finalized.revision, 1);
    assert_eq!(finalized.start_at_time, Some(hour(1)));
    assert_eq!(finalized.end_at_time, Some(hour(2)));

    assert!(!repository.destroy(&blob.id, Some(&Condition::with_revision(0))).await?);
    assert!(repository.destroy(&blob.id, None).await?);
    assert!(repository.get(&blob.id).await?.is_none());
    assert!(!repository.destroy(&blob.id, None).await?);

    repository.create(&user, &DeviceLogsCreate::new()).await?;
    assert!(repository.destroy_all(&user).await?);
    assert!(!repository.destroy_all(&user).await?);
    Ok(())
}

async fn test_device_logs_list_window(repository: &dyn DeviceLogsRepository) -> BlobResult<()> {
    let user = fresh_user();
    let mut ids = Vec::new();
    for (start, end) in [(1, 3), (5, 6), (2, 4)] {
        let blob = repository.create(&user, &DeviceLogsCreate::new()).await?;
        repository.update(&blob.id, None, &window(start, end)).await?;
        ids.push(blob.id);
    }
    repository.create(&user, &DeviceLogsCreate::new()).await?;

    let listed: Vec<BlobId> = repository
        .list(&user, &DeviceLogsFilter::new(), &Pagination::default())
        .await?
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(
        listed,
        vec![ids[1].clone(), ids[2].clone(), ids[0].clone()],
        "finalized only, latest start first"
    );

    let windowed: Vec<BlobId> = repository
        .list(
            &user,
            &DeviceLogsFilter::new().starting_at(hour(2)).ending_before(hour(6)),
            &Pagination::default(),
        )
        .await?
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(windowed, vec![ids[2].clone()]);

    let paged = repository
        .list(&user, &DeviceLogsFilter::new(), &Pagination::new(1, 1))
        .await?;
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].id, ids[2]);
    Ok(())
}

async fn test_device_logs_range_stays_ordered(
    repository: &dyn DeviceLogsRepository,
) -> BlobResult<()> {
    let user = fresh_user();
    let blob = repository.create(&user, &DeviceLogsCreate::new()).await?;
    repository
        .update(&blob.id, None, &window(5, 6))
        .await?
        .ok_or_else(|| missing("finalize"))?;

    let end_before_start = DeviceLogsUpdate {
        end_at_time: Some(hour(1)),
        ..DeviceLogsUpdate::new()
    };
    let result = repository.update(&blob.id, None, &end_before_start).await;
    assert!(matches!(result, Err(BlobError::Invalid { .. })));

    let start_after_end = DeviceLogsUpdate {
        start_at_time: Some(hour(7)),
        ..DeviceLogsUpdate::new()
    };
    let result = repository.update(&blob.id, None, &start_after_end).await;
    assert!(matches!(result, Err(BlobError::Invalid { .. })));

    let stored = repository.get(&blob.id).await?.ok_or_else(|| missing("record"))?;
    assert_eq!(stored.start_at_time, Some(hour(5)));
    assert_eq!(stored.end_at_time, Some(hour(6)));
    assert_eq!(stored.revision, 1);

    let extended = DeviceLogsUpdate {
        end_at_time: Some(hour(8)),
        ..DeviceLogsUpdate::new()
    };
    let extended = repository
        .update(&blob.id, None, &extended)
        .await?
        .ok_or_else(|| missing("extend end"))?;
    assert_eq!(extended.end_at_time, Some(hour(8)));

    let refinalize = repository.update(&blob.id, None, &window(5, 9)).await;
    assert!(matches!(refinalize, Err(BlobError::Invalid { .. })));

    repository.destroy_all(&user).await?;
    Ok(())
}

async fn test_device_logs_input_validation(
    repository: &dyn DeviceLogsRepository,
) -> BlobResult<()> {
    let user = fresh_user();
    let inverted = repository
        .list(
            &user,
            &DeviceLogsFilter::new().starting_at(hour(5)).ending_before(hour(1)),
            &Pagination::default(),
        )
        .await;
    assert!(matches!(inverted, Err(BlobError::Invalid { .. })));

    let blob = repository.create(&user, &DeviceLogsCreate::new()).await?;
    let backwards = repository.update(&blob.id, None, &window(4, 2)).await;
    assert!(matches!(backwards, Err(BlobError::Invalid { .. })));
    assert!(matches!(
        repository.create("", &DeviceLogsCreate::new()).await,
        Err(BlobError::Invalid { .. })
    ));
    repository.destroy_all(&user).await?;
    Ok(())
}

/// Run the content store conformance suite.
///
/// # Errors
///
/// Returns an error if the backend fails; assertion failures panic.
pub async fn run_content_store_conformance(store: &dyn ContentStore) -> BlobResult<()> {
    test_content_put_get_exists(store).await?;
    test_content_delete(store).await?;
    test_content_get_many(store).await?;
    test_content_delete_all(store).await?;
    Ok(())
}

async fn test_content_put_get_exists(store: &dyn ContentStore) -> BlobResult<()> {
    let owner = fresh_user();
    let id = BlobId::new();
    assert!(!store.exists(&owner, &id).await?);
    assert!(store.get(&owner, &id).await?.is_none(), "absent object reads as None");

    store
        .put(&owner, &id, bytes_stream("hello"), PutOptions::with_media_type(Some("text/plain".into())))
        .await?;
    assert!(store.exists(&owner, &id).await?);
    let content = store.get(&owner, &id).await?.ok_or_else(|| missing("stored object"))?;
    assert_eq!(read_to_end(content).await?, b"hello".to_vec());

    store.put(&owner, &id, bytes_stream("bye"), PutOptions::new()).await?;
    let content = store.get(&owner, &id).await?.ok_or_else(|| missing("stored object"))?;
    assert_eq!(read_to_end(content).await?, b"bye".to_vec(), "put overwrites");

    let empty = BlobId::new();
    store.put(&owner, &empty, bytes_stream(""), PutOptions::new()).await?;
    let content = store.get(&owner, &empty).await?.ok_or_else(|| missing("empty object"))?;
    assert!(read_to_end(content).await?.is_empty());

    store.delete_all(&owner).await?;
    Ok(())
}

async fn test_content_delete(store: &dyn ContentStore) -> BlobResult<()> {
    let owner = fresh_user();
    let id = BlobId::new();
    store.put(&owner, &id, bytes_stream("x"), PutOptions::new()).await?;

    assert!(store.delete(&owner, &id).await?);
    assert!(!store.exists(&owner, &id).await?);
    assert!(!store.delete(&owner, &id).await?, "second delete reports absence");
    Ok(())
}

async fn test_content_get_many(store: &dyn ContentStore) -> BlobResult<()> {
    let owner = fresh_user();
    let mut ids = Vec::new();
    for i in 0..6 {
        let id = BlobId::new();
        store
            .put(&owner, &id, bytes_stream(format!("object-{}", i)), PutOptions::new())
            .await?;
        ids.push(id);
    }

    let streams = store.get_many(&owner, &ids).await?;
    assert_eq!(streams.len(), ids.len());
    for (i, stream) in streams.into_iter().enumerate() {
        assert_eq!(read_to_end(stream).await?, format!("object-{}", i).into_bytes());
    }

    let mut with_missing = ids.clone();
    with_missing.insert(2, BlobId::new());
    let result = store.get_many(&owner, &with_missing).await;
    assert!(matches!(result, Err(BlobError::NotFound { .. })));

    assert!(store.get_many(&owner, &[]).await?.is_empty());
    store.delete_all(&owner).await?;
    Ok(())
}

async fn test_content_delete_all(store: &dyn ContentStore) -> BlobResult<()> {
    let owner = fresh_user();
    let bystander = fresh_user();
    let ids = [BlobId::new(), BlobId::new()];
    for id in &ids {
        store.put(&owner, id, bytes_stream("x"), PutOptions::new()).await?;
    }
    let kept = BlobId::new();
    store.put(&bystander, &kept, bytes_stream("y"), PutOptions::new()).await?;

    store.delete_all(&owner).await?;
    for id in &ids {
        assert!(!store.exists(&owner, id).await?);
    }
    assert!(store.exists(&bystander, &kept).await?, "other owners untouched");

    store.delete_all(&owner).await?;
    store.delete_all(&bystander).await?;
    Ok(())
}
