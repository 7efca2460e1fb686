use sqlx::PgPool;

use super::PostgresConfig;

/// Create the blob and device-logs tables and their indexes if missing.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let blobs_table = config.blobs_table();
    let device_logs_table = config.device_logs_table();

    // `seq` orders rows created within the same timestamp.
    let create_blobs = format!(
        "CREATE TABLE IF NOT EXISTS {blobs_table} (
            seq BIGSERIAL NOT NULL,
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            media_type TEXT,
            digest_md5 TEXT,
            size BIGINT,
            status TEXT NOT NULL,
            created_time TIMESTAMPTZ NOT NULL,
            modified_time TIMESTAMPTZ,
            deleted_time TIMESTAMPTZ,
            revision BIGINT NOT NULL DEFAULT 0
        )"
    );

    let create_device_logs = format!(
        "CREATE TABLE IF NOT EXISTS {device_logs_table} (
            seq BIGSERIAL NOT NULL,
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            media_type TEXT,
            digest_md5 TEXT,
            size BIGINT,
            start_at_time TIMESTAMPTZ,
            end_at_time TIMESTAMPTZ,
            created_time TIMESTAMPTZ NOT NULL,
            modified_time TIMESTAMPTZ,
            revision BIGINT NOT NULL DEFAULT 0
        )"
    );

    let indexes = [
        ("blobs", &blobs_table, "user_id", "user_id"),
        ("blobs", &blobs_table, "media_type", "media_type"),
        ("blobs", &blobs_table, "status", "status"),
        ("device_logs", &device_logs_table, "user_id_start_at_time", "user_id, start_at_time"),
        ("device_logs", &device_logs_table, "user_id_end_at_time", "user_id, end_at_time"),
        ("device_logs", &device_logs_table, "start_at_time", "start_at_time"),
        ("device_logs", &device_logs_table, "end_at_time", "end_at_time"),
    ];

    sqlx::query(&create_blobs).execute(pool).await?;
    sqlx::query(&create_device_logs).execute(pool).await?;
    for (table, qualified, name, columns) in indexes {
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {qualified} ({columns})",
            config.index_name(table, name)
        );
        sqlx::query(&create_index).execute(pool).await?;
    }

    Ok(())
}
