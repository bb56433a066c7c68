use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the catalog tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // AUTOINCREMENT keeps ids of rolled-back or removed rows from being reused.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            title TEXT NOT NULL,
            year INTEGER,
            media_type TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT 'null',
            payload_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_key TEXT NOT NULL,
            catalog_key TEXT NOT NULL,
            origin TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS variants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            variant_key TEXT NOT NULL,
            catalog_key TEXT NOT NULL,
            descriptors_json TEXT NOT NULL DEFAULT 'null',
            payload_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Unique key indexes, used by the upsert lookup phase
    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_catalog_records_key ON catalog_records(key)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_source_references_key ON source_references(source_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_variants_key ON variants(variant_key)")
        .execute(pool)
        .await?;

    // Secondary indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_source_references_catalog ON source_references(catalog_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_source_references_origin ON source_references(origin)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_variants_catalog ON variants(catalog_key)")
        .execute(pool)
        .await?;

    Ok(())
}
