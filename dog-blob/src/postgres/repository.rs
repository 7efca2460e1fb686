use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{migrations, PostgresConfig};
use crate::repository::{
    random_ids, BlobRepository, DeviceLogsRepository, IdGenerator, CREATE_ID_ATTEMPTS,
};
use crate::types::{validate_condition, validate_user_id};
use crate::{
    Blob, BlobCreate, BlobError, BlobFilter, BlobId, BlobResult, BlobStatus, BlobUpdate,
    Condition, DeviceLogsBlob, DeviceLogsCreate, DeviceLogsFilter, DeviceLogsUpdate, Liveness,
    Pagination,
};

const BLOB_COLUMNS: &str = "id, user_id, media_type, digest_md5, size, status, \
     created_time, modified_time, deleted_time, revision";

const DEVICE_LOGS_COLUMNS: &str = "id, user_id, media_type, digest_md5, size, \
     start_at_time, end_at_time, created_time, modified_time, revision";

async fn connect(config: &PostgresConfig) -> BlobResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.url)
        .await?;
    migrations::run_migrations(&pool, config).await?;
    Ok(pool)
}

fn revision_of(condition: Option<&Condition>) -> Option<i64> {
    condition.and_then(|c| c.revision)
}

fn size_to_column(size: u64) -> BlobResult<i64> {
    i64::try_from(size).map_err(|_| BlobError::invalid(format!("size {} is too large", size)))
}

fn size_from_column(size: Option<i64>) -> BlobResult<Option<u64>> {
    size.map(|size| {
        u64::try_from(size).map_err(|_| BlobError::invalid(format!("stored size {} is negative", size)))
    })
    .transpose()
}

fn page_bounds(pagination: &Pagination) -> (i64, i64) {
    let offset = i64::try_from(pagination.offset()).unwrap_or(i64::MAX);
    (i64::from(pagination.size), offset)
}

fn blob_from_row(row: &PgRow) -> BlobResult<Blob> {
    let status: String = row.try_get("status")?;
    Ok(Blob {
        id: BlobId::from_string(row.try_get("id")?),
        user_id: row.try_get("user_id")?,
        media_type: row.try_get("media_type")?,
        digest_md5: row.try_get("digest_md5")?,
        size: size_from_column(row.try_get("size")?)?,
        status: BlobStatus::parse(&status)?,
        created_time: row.try_get("created_time")?,
        modified_time: row.try_get("modified_time")?,
        liveness: Liveness::from_deleted_time(row.try_get("deleted_time")?),
        revision: row.try_get("revision")?,
    })
}

fn device_logs_from_row(row: &PgRow) -> BlobResult<DeviceLogsBlob> {
    Ok(DeviceLogsBlob {
        id: BlobId::from_string(row.try_get("id")?),
        user_id: row.try_get("user_id")?,
        media_type: row.try_get("media_type")?,
        digest_md5: row.try_get("digest_md5")?,
        size: size_from_column(row.try_get("size")?)?,
        start_at_time: row.try_get("start_at_time")?,
        end_at_time: row.try_get("end_at_time")?,
        created_time: row.try_get("created_time")?,
        modified_time: row.try_get("modified_time")?,
        revision: row.try_get("revision")?,
    })
}

/// PostgreSQL-backed [`BlobRepository`].
///
/// Conditional statements (`... AND revision = $n`) give compare-and-swap
/// semantics; soft deletes set `deleted_time`.
pub struct PostgresBlobRepository {
    pool: PgPool,
    config: Arc<PostgresConfig>,
    ids: IdGenerator,
}

impl PostgresBlobRepository {
    /// Connect, create the pool and run migrations.
    pub async fn connect(config: PostgresConfig) -> BlobResult<Self> {
        let pool = connect(&config).await?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            ids: random_ids(),
        })
    }

    /// Share an existing pool. Runs migrations.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> BlobResult<Self> {
        migrations::run_migrations(&pool, &config).await?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            ids: random_ids(),
        })
    }

    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BlobRepository for PostgresBlobRepository {
    async fn list(
        &self,
        user_id: &str,
        filter: &BlobFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<Blob>> {
        validate_user_id(user_id)?;
        filter.validate()?;
        pagination.validate()?;

        let table = self.config.blobs_table();
        let statuses: Vec<String> = filter
            .statuses()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        let (limit, offset) = page_bounds(pagination);

        let query = format!(
            "SELECT {BLOB_COLUMNS} FROM {table} \
             WHERE user_id = $1 AND deleted_time IS NULL \
               AND status = ANY($2) \
               AND ($3::TEXT[] IS NULL OR media_type = ANY($3)) \
             ORDER BY created_time DESC, seq DESC \
             LIMIT $4 OFFSET $5"
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(statuses)
            .bind(filter.media_type.clone())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(blob_from_row).collect()
    }

    async fn create(&self, user_id: &str, create: &BlobCreate) -> BlobResult<Blob> {
        validate_user_id(user_id)?;
        create.validate()?;

        let table = self.config.blobs_table();
        let query = format!(
            "INSERT INTO {table} (id, user_id, media_type, status, created_time, revision) \
             VALUES ($1, $2, $3, $4, $5, 0) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING {BLOB_COLUMNS}"
        );

        for attempt in 1..=CREATE_ID_ATTEMPTS {
            let id = (self.ids)();
            let row = sqlx::query(&query)
                .bind(id.as_str())
                .bind(user_id)
                .bind(create.media_type.as_deref())
                .bind(BlobStatus::Created.as_str())
                .bind(Utc::now())
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => return blob_from_row(&row),
                None => debug!(blob_id = %id, attempt, "blob id already taken"),
            }
        }
        Err(BlobError::conflict(format!(
            "no unique blob id after {} attempts",
            CREATE_ID_ATTEMPTS
        )))
    }

    async fn get(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<Option<Blob>> {
        id.validate()?;
        validate_condition(condition)?;

        let table = self.config.blobs_table();
        let query = format!(
            "SELECT {BLOB_COLUMNS} FROM {table} \
             WHERE id = $1 AND deleted_time IS NULL \
               AND ($2::BIGINT IS NULL OR revision = $2)"
        );

        let row = sqlx::query(&query)
            .bind(id.as_str())
            .bind(revision_of(condition))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(blob_from_row).transpose()
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

        let table = self.config.blobs_table();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE {table} SET revision = revision + 1, modified_time = "
        ));
        builder.push_bind(Utc::now());
        if let Some(digest_md5) = &update.digest_md5 {
            builder.push(", digest_md5 = ").push_bind(digest_md5.clone());
        }
        if let Some(media_type) = &update.media_type {
            builder.push(", media_type = ").push_bind(media_type.clone());
        }
        if let Some(size) = update.size {
            builder.push(", size = ").push_bind(size_to_column(size)?);
        }
        if let Some(status) = update.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        builder
            .push(" WHERE id = ")
            .push_bind(id.as_str().to_string())
            .push(" AND deleted_time IS NULL");
        if let Some(revision) = revision_of(condition) {
            builder.push(" AND revision = ").push_bind(revision);
        }
        if update.sets_content() {
            builder.push(" AND digest_md5 IS NULL AND size IS NULL");
        }
        builder.push(format!(" RETURNING {BLOB_COLUMNS}"));

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => blob_from_row(&row).map(Some),
            None if update.sets_content() => {
                // Tell a guarded-out patch apart from a missing or stale record.
                if let Some(current) = self.get(id, condition).await? {
                    current.check_update(update)?;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let table = self.config.blobs_table();
        let query = format!(
            "UPDATE {table} \
             SET deleted_time = $2, modified_time = $2, revision = revision + 1 \
             WHERE id = $1 AND deleted_time IS NULL \
               AND ($3::BIGINT IS NULL OR revision = $3)"
        );

        let result = sqlx::query(&query)
            .bind(id.as_str())
            .bind(Utc::now())
            .bind(revision_of(condition))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let table = self.config.blobs_table();
        let query = format!(
            "DELETE FROM {table} WHERE id = $1 AND ($2::BIGINT IS NULL OR revision = $2)"
        );

        let result = sqlx::query(&query)
            .bind(id.as_str())
            .bind(revision_of(condition))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let table = self.config.blobs_table();
        let query = format!(
            "UPDATE {table} \
             SET deleted_time = $2, modified_time = $2, revision = revision + 1 \
             WHERE user_id = $1 AND deleted_time IS NULL"
        );

        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let table = self.config.blobs_table();
        let query = format!("DELETE FROM {table} WHERE user_id = $1");

        let result = sqlx::query(&query)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL-backed [`DeviceLogsRepository`].
pub struct PostgresDeviceLogsRepository {
    pool: PgPool,
    config: Arc<PostgresConfig>,
    ids: IdGenerator,
}

impl PostgresDeviceLogsRepository {
    pub async fn connect(config: PostgresConfig) -> BlobResult<Self> {
        let pool = connect(&config).await?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            ids: random_ids(),
        })
    }

    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> BlobResult<Self> {
        migrations::run_migrations(&pool, &config).await?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            ids: random_ids(),
        })
    }

    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    async fn get_conditional(
        &self,
        id: &BlobId,
        condition: Option<&Condition>,
    ) -> BlobResult<Option<DeviceLogsBlob>> {
        let table = self.config.device_logs_table();
        let query = format!(
            "SELECT {DEVICE_LOGS_COLUMNS} FROM {table} \
             WHERE id = $1 AND ($2::BIGINT IS NULL OR revision = $2)"
        );

        let row = sqlx::query(&query)
            .bind(id.as_str())
            .bind(revision_of(condition))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(device_logs_from_row).transpose()
    }
}

#[async_trait]
impl DeviceLogsRepository for PostgresDeviceLogsRepository {
    async fn list(
        &self,
        user_id: &str,
        filter: &DeviceLogsFilter,
        pagination: &Pagination,
    ) -> BlobResult<Vec<DeviceLogsBlob>> {
        validate_user_id(user_id)?;
        filter.validate()?;
        pagination.validate()?;

        let table = self.config.device_logs_table();
        let (limit, offset) = page_bounds(pagination);
        let query = format!(
            "SELECT {DEVICE_LOGS_COLUMNS} FROM {table} \
             WHERE user_id = $1 \
               AND start_at_time IS NOT NULL AND end_at_time IS NOT NULL \
               AND ($2::TIMESTAMPTZ IS NULL OR start_at_time >= $2) \
               AND ($3::TIMESTAMPTZ IS NULL OR end_at_time < $3) \
             ORDER BY start_at_time DESC, seq DESC \
             LIMIT $4 OFFSET $5"
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(filter.start_at_time)
            .bind(filter.end_at_time)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(device_logs_from_row).collect()
    }

    async fn create(
        &self,
        user_id: &str,
        create: &DeviceLogsCreate,
    ) -> BlobResult<DeviceLogsBlob> {
        validate_user_id(user_id)?;
        create.validate()?;

        let table = self.config.device_logs_table();
        let query = format!(
            "INSERT INTO {table} (id, user_id, media_type, created_time, revision) \
             VALUES ($1, $2, $3, $4, 0) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING {DEVICE_LOGS_COLUMNS}"
        );

        for attempt in 1..=CREATE_ID_ATTEMPTS {
            let id = (self.ids)();
            let row = sqlx::query(&query)
                .bind(id.as_str())
                .bind(user_id)
                .bind(create.media_type.as_deref())
                .bind(Utc::now())
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => return device_logs_from_row(&row),
                None => debug!(blob_id = %id, attempt, "device logs id already taken"),
            }
        }
        Err(BlobError::conflict(format!(
            "no unique device logs id after {} attempts",
            CREATE_ID_ATTEMPTS
        )))
    }

    async fn get(&self, id: &BlobId) -> BlobResult<Option<DeviceLogsBlob>> {
        id.validate()?;
        self.get_conditional(id, None).await
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
        if update.is_empty() {
            return self.get_conditional(id, condition).await;
        }

        let table = self.config.device_logs_table();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE {table} SET revision = revision + 1, modified_time = "
        ));
        builder.push_bind(Utc::now());
        if let Some(digest_md5) = &update.digest_md5 {
            builder.push(", digest_md5 = ").push_bind(digest_md5.clone());
        }
        if let Some(media_type) = &update.media_type {
            builder.push(", media_type = ").push_bind(media_type.clone());
        }
        if let Some(size) = update.size {
            builder.push(", size = ").push_bind(size_to_column(size)?);
        }
        if let Some(start_at_time) = update.start_at_time {
            builder.push(", start_at_time = ").push_bind(start_at_time);
        }
        if let Some(end_at_time) = update.end_at_time {
            builder.push(", end_at_time = ").push_bind(end_at_time);
        }
        builder.push(" WHERE id = ").push_bind(id.as_str().to_string());
        if let Some(revision) = revision_of(condition) {
            builder.push(" AND revision = ").push_bind(revision);
        }
        if update.sets_content() {
            builder.push(" AND digest_md5 IS NULL AND size IS NULL");
        }
        let guards_range = update.start_at_time.is_some() != update.end_at_time.is_some();
        match (update.start_at_time, update.end_at_time) {
            (Some(start_at_time), None) => {
                builder
                    .push(" AND (end_at_time IS NULL OR end_at_time >= ")
                    .push_bind(start_at_time)
                    .push(")");
            }
            (None, Some(end_at_time)) => {
                builder
                    .push(" AND (start_at_time IS NULL OR start_at_time <= ")
                    .push_bind(end_at_time)
                    .push(")");
            }
            _ => {}
        }
        builder.push(format!(" RETURNING {DEVICE_LOGS_COLUMNS}"));

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => device_logs_from_row(&row).map(Some),
            None if update.sets_content() || guards_range => {
                if let Some(current) = self.get_conditional(id, condition).await? {
                    current.check_update(update)?;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn destroy(&self, id: &BlobId, condition: Option<&Condition>) -> BlobResult<bool> {
        id.validate()?;
        validate_condition(condition)?;

        let table = self.config.device_logs_table();
        let query = format!(
            "DELETE FROM {table} WHERE id = $1 AND ($2::BIGINT IS NULL OR revision = $2)"
        );

        let result = sqlx::query(&query)
            .bind(id.as_str())
            .bind(revision_of(condition))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn destroy_all(&self, user_id: &str) -> BlobResult<bool> {
        validate_user_id(user_id)?;

        let table = self.config.device_logs_table();
        let query = format!("DELETE FROM {table} WHERE user_id = $1");

        let result = sqlx::query(&query)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
