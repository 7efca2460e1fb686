use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::repository::{
    random_ids, BlobRepository, DeviceLogsRepository, IdGenerator, CREATE_ID_ATTEMPTS,
};
use crate::types::{condition_matches, validate_condition, validate_user_id};
use crate::{
    Blob, BlobCreate, BlobError, BlobFilter, BlobId, BlobResult, BlobUpdate, Condition,
    DeviceLogsBlob, DeviceLogsCreate, DeviceLogsFilter, DeviceLogsUpdate, Pagination,
};

struct Row<T> {
    /// Insertion order; breaks ties between equal sort keys.
    seq: u64,
    record: T,
}

struct Table<T> {
    rows: HashMap<BlobId, Row<T>>,
    next_seq: u64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T: Clone> Table<T> {
    /// Insert unless the id is taken.
    fn insert(&mut self, id: BlobId, record: T) -> bool {
        if self.rows.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(id, Row { seq, record });
        true
    }
}

fn reserve<T: Clone>(
    table: &RwLock<Table<T>>,
    ids: &IdGenerator,
    make: impl Fn(BlobId) -> T,
) -> BlobResult<T> {
    for attempt in 1..=CREATE_ID_ATTEMPTS {
        let id = ids();
        let record = make(id.clone());
        if table.write().insert(id.clone(), record.clone()) {
            return Ok(record);
        }
        debug!(blob_id = %id, attempt, "blob id already taken");
    }
    Err(BlobError::conflict(format!(
        "no unique blob id after {} attempts",
        CREATE_ID_ATTEMPTS
    )))
}

/// In-memory blob repository
pub struct MemoryBlobRepository {
    table: RwLock<Table<Blob>>,
    ids: IdGenerator,
}

impl MemoryBlobRepository {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            ids: random_ids(),
        }
    }

    /// Replace the id source.
    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Rows held, tombstoned ones included.
    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBlobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobRepository for MemoryBlobRepository {
    async fn list(
        &self,
        user_id: &str,
        filter: &BlobFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<Blob>> {
        validate_user_id(user_id)?;
        filter.validate()?;
        pagination.validate()?;

        let table = self.table.read();
        let mut rows: Vec<&Row<Blob>> = table
            .rows
            .values()
            .filter(|row| row.record.user_id == user_id && filter.matches(&row.record))
            .collect();
        rows.sort_by(|a, b| {
            b.record
                .created_time
                .cmp(&a.record.created_time)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(pagination
            .apply(rows)
            .into_iter()
            .map(|row| row.record.clone())
            .collect())
    }

    async fn create(&self, user_id: &str, create: &BlobCreate) -> BlobResult<Blob> {
        validate_user_id(user_id)?;
        create.validate()?;
        reserve(&self.table, &self.ids, |id| Blob::reserve(id, user_id, create))
    }

    async fn get(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<Option<Blob>> {
        id.validate()?;
        validate_condition(condition)?;

        Ok(self
            .table
            .read()
            .rows
            .get(id)
            .map(|row| &row.record)
            .filter(|blob| blob.is_live() && condition_matches(condition, blob.revision))
            .cloned())
    }

    async fn update(
        &self,
        id: &BlobId,
        condition: Option<&Condition>,
        update: &BlobUpdate,
    ) -> BlobResult<Option<Blob>> {
        id.validate()?;
        validate_condition(condition)?;
        update.validate()?;
        if update.is_empty() {
            return self.get(id, condition).await;
        }

        let mut table = self.table.write();
        let Some(row) = table.rows.get_mut(id) else {
            return Ok(None);
        };
        if !row.record.is_live() || !condition_matches(condition, row.record.revision) {
            return Ok(None);
        }
        row.record.check_update(update)?;
        row.record.apply(update, Utc::now());
        Ok(Some(row.record.clone()))
    }

    async fn delete(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let mut table = self.table.write();
        match table.rows.get_mut(id) {
            Some(row)
                if row.record.is_live() && condition_matches(condition, row.record.revision) =>
            {
                row.record.tombstone(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let mut table = self.table.write();
        let matched = table
            .rows
            .get(id)
            .map_or(false, |row| condition_matches(condition, row.record.revision));
        if matched {
            table.rows.remove(id);
        }
        Ok(matched)
    }

    async fn delete_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let now = Utc::now();
        let mut matched = false;
        for row in self.table.write().rows.values_mut() {
            if row.record.user_id == user_id && row.record.is_live() {
                row.record.tombstone(now);
                matched = true;
            }
        }
        Ok(matched)
    }

    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let mut table = self.table.write();
        let before = table.rows.len();
        table.rows.retain(|_, row| row.record.user_id != user_id);
        Ok(table.rows.len() < before)
    }
}

/// In-memory device-logs repository
pub struct MemoryDeviceLogsRepository {
    table: RwLock<Table<DeviceLogsBlob>>,
    ids: IdGenerator,
}

impl MemoryDeviceLogsRepository {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
            ids: random_ids(),
        }
    }

    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDeviceLogsRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceLogsRepository for MemoryDeviceLogsRepository {
    async fn list(
        &self,
        user_id: &str,
        filter: &DeviceLogsFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<DeviceLogsBlob>> {
        validate_user_id(user_id)?;
        filter.validate()?;
        pagination.validate()?;

        let table = self.table.read();
        let mut rows: Vec<&Row<DeviceLogsBlob>> = table
            .rows
            .values()
            .filter(|row| row.record.user_id == user_id && filter.matches(&row.record))
            .collect();
        rows.sort_by(|a, b| {
            b.record
                .start_at_time
                .cmp(&a.record.start_at_time)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(pagination
            .apply(rows)
            .into_iter()
            .map(|row| row.record.clone())
            .collect())
    }

    async fn create(
        &self,
        user_id: &str,
        create: &DeviceLogsCreate,
    ) -> BlobResult<DeviceLogsBlob> {
        validate_user_id(user_id)?;
        create.validate()?;
        reserve(&self.table, &self.ids, |id| {
            DeviceLogsBlob::reserve(id, user_id, create)
        })
    }

    async fn get(&self, id: &BlobId) -> BlobResult<Option<DeviceLogsBlob>> {
        id.validate()?;
        Ok(self.table.read().rows.get(id).map(|row| row.record.clone()))
    }

    async fn update(
        &self,
        id: &BlobId,
        condition: Option<&Condition>,
        update: &DeviceLogsUpdate,
    ) -> BlobResult<Option<DeviceLogsBlob>> {
        id.validate()?;
        validate_condition(condition)?;
        update.validate()?;

        let mut table = self.table.write();
        let Some(row) = table.rows.get_mut(id) else {
            return Ok(None);
        };
        if !condition_matches(condition, row.record.revision) {
            return Ok(None);
        }
        if !update.is_empty() {
            row.record.check_update(update)?;
            row.record.apply(update, Utc::now());
        }
        Ok(Some(row.record.clone()))
    }

    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let mut table = self.table.write();
        let matched = table
            .rows
            .get(id)
            .map_or(false, |row| condition_matches(condition, row.record.revision));
        if matched {
            table.rows.remove(id);
        }
        Ok(matched)
    }

    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let mut table = self.table.write();
        let before = table.rows.len();
        table.rows.retain(|_, row| row.record.user_id != user_id);
        Ok(table.rows.len() < before)
    }
}
