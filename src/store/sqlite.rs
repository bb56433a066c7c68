//! SQLite-backed [`CatalogStore`] implementation.
//!
//! Each record kind has its own table (`catalog_records`,
//! `source_references`, `variants`) with an `AUTOINCREMENT` primary key, so
//! internal ids are never reused, and a `UNIQUE` business key. Writes use a
//! plain `INSERT` for new rows rather than `ON CONFLICT`, so a conflict the
//! lookup phase missed surfaces as an error instead of being absorbed.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::models::{Candidate, RecordKind};

use super::{CatalogStore, CommitError, CommitOutcome, Prepared, RecordOutcome};

/// SQLite implementation of the [`CatalogStore`] trait.
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Table and key column for a record kind.
pub(crate) fn table_for(kind: RecordKind) -> (&'static str, &'static str) {
    match kind {
        RecordKind::Catalog => ("catalog_records", "key"),
        RecordKind::Source => ("source_references", "source_key"),
        RecordKind::Variant => ("variants", "variant_key"),
    }
}

fn storage(err: sqlx::Error) -> CommitError {
    CommitError::Storage(err.to_string())
}

fn write_error(err: sqlx::Error, candidate: &Candidate) -> CommitError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return CommitError::InvariantViolation {
                kind: candidate.kind(),
                key: candidate.key().to_string(),
            };
        }
    }
    storage(err)
}

async fn find_id(
    conn: &mut SqliteConnection,
    kind: RecordKind,
    key: &str,
) -> Result<Option<i64>, sqlx::Error> {
    let (table, column) = table_for(kind);
    sqlx::query_scalar(&format!("SELECT id FROM {} WHERE {} = ?", table, column))
        .bind(key)
        .fetch_optional(conn)
        .await
}

async fn insert_row(
    conn: &mut SqliteConnection,
    candidate: &Candidate,
    hash: &str,
    now: i64,
) -> Result<i64, sqlx::Error> {
    let result = match candidate {
        Candidate::Catalog(r) => {
            sqlx::query(
                r#"
                INSERT INTO catalog_records (key, title, year, media_type, metadata_json,
                                             payload_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.key)
            .bind(&r.title)
            .bind(r.year)
            .bind(&r.media_type)
            .bind(r.metadata.to_string())
            .bind(hash)
            .bind(now)
            .bind(now)
            .execute(conn)
            .await?
        }
        Candidate::Source(r) => {
            sqlx::query(
                r#"
                INSERT INTO source_references (source_key, catalog_key, origin,
                                               payload_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.source_key)
            .bind(&r.catalog_key)
            .bind(&r.origin)
            .bind(hash)
            .bind(now)
            .bind(now)
            .execute(conn)
            .await?
        }
        Candidate::Variant(r) => {
            sqlx::query(
                r#"
                INSERT INTO variants (variant_key, catalog_key, descriptors_json,
                                      payload_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.variant_key)
            .bind(&r.catalog_key)
            .bind(r.descriptors.to_string())
            .bind(hash)
            .bind(now)
            .bind(now)
            .execute(conn)
            .await?
        }
    };
    Ok(result.last_insert_rowid())
}

async fn update_row(
    conn: &mut SqliteConnection,
    id: i64,
    candidate: &Candidate,
    hash: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    match candidate {
        Candidate::Catalog(r) => {
            sqlx::query(
                r#"
                UPDATE catalog_records
                SET title = ?, year = ?, media_type = ?, metadata_json = ?,
                    payload_hash = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&r.title)
            .bind(r.year)
            .bind(&r.media_type)
            .bind(r.metadata.to_string())
            .bind(hash)
            .bind(now)
            .bind(id)
            .execute(conn)
            .await?;
        }
        Candidate::Source(r) => {
            sqlx::query(
                r#"
                UPDATE source_references
                SET catalog_key = ?, origin = ?, payload_hash = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&r.catalog_key)
            .bind(&r.origin)
            .bind(hash)
            .bind(now)
            .bind(id)
            .execute(conn)
            .await?;
        }
        Candidate::Variant(r) => {
            sqlx::query(
                r#"
                UPDATE variants
                SET catalog_key = ?, descriptors_json = ?, payload_hash = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&r.catalog_key)
            .bind(r.descriptors.to_string())
            .bind(hash)
            .bind(now)
            .bind(id)
            .execute(conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn commit(&self, batch: &[Candidate]) -> Result<CommitOutcome, CommitError> {
        let prepared = Prepared::new(batch)?;
        if prepared.valid.is_empty() {
            return Ok(prepared.finish(Vec::new()));
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Phase 1: every lookup before the first write.
        let mut existing = Vec::with_capacity(prepared.valid.len());
        for (_, candidate) in &prepared.valid {
            let id = find_id(&mut *tx, candidate.kind(), candidate.key())
                .await
                .map_err(storage)?;
            existing.push(id);
        }

        // Phase 2: write. Dropping `tx` on any early return rolls back.
        let mut written = Vec::with_capacity(prepared.valid.len());
        for ((_, candidate), existing) in prepared.valid.iter().zip(existing) {
            let hash = candidate.payload_hash();
            match existing {
                Some(id) => {
                    update_row(&mut *tx, id, candidate, &hash, now)
                        .await
                        .map_err(|e| write_error(e, candidate))?;
                    written.push(RecordOutcome::Updated { id });
                }
                None => {
                    let id = insert_row(&mut *tx, candidate, &hash, now)
                        .await
                        .map_err(|e| write_error(e, candidate))?;
                    written.push(RecordOutcome::Inserted { id });
                }
            }
        }

        tx.commit().await.map_err(storage)?;
        Ok(prepared.finish(written))
    }

    async fn lookup_id(&self, kind: RecordKind, key: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        Ok(find_id(&mut *conn, kind, key).await?)
    }

    async fn count(&self, kind: RecordKind) -> Result<u64> {
        let (table, _) = table_for(kind);
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
