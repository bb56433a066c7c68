//! Catalog statistics.
//!
//! A quick summary of what has been ingested: row counts per table and a
//! per-origin breakdown of source references. Used by `catalog-ingest stats`
//! to confirm that syncs land where expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Per-origin breakdown of source references.
#[derive(Debug, Clone, Serialize)]
pub struct OriginStats {
    pub origin: String,
    pub references: i64,
    pub catalog_records: i64,
    pub last_update_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub catalog_records: i64,
    pub source_references: i64,
    pub variants: i64,
    pub origins: Vec<OriginStats>,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<CatalogStats> {
    let catalog_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_records")
        .fetch_one(pool)
        .await?;
    let source_references: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_references")
        .fetch_one(pool)
        .await?;
    let variants: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM variants")
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query(
        r#"
        SELECT
            origin,
            COUNT(*) AS references_count,
            COUNT(DISTINCT catalog_key) AS catalog_count,
            MAX(updated_at) AS last_update
        FROM source_references
        GROUP BY origin
        ORDER BY references_count DESC, origin
        "#,
    )
    .fetch_all(pool)
    .await?;

    let origins = rows
        .iter()
        .map(|row| OriginStats {
            origin: row.get("origin"),
            references: row.get("references_count"),
            catalog_records: row.get("catalog_count"),
            last_update_ts: row.get("last_update"),
        })
        .collect();

    Ok(CatalogStats {
        catalog_records,
        source_references,
        variants,
        origins,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let now = chrono::Utc::now().timestamp();

    println!("Catalog Stats");
    println!("=============");
    println!();
    println!("  Database:           {}", config.db.path.display());
    println!("  Size:               {}", format_size(db_size));
    println!();
    println!("  Catalog records:    {}", stats.catalog_records);
    println!("  Source references:  {}", stats.source_references);
    println!("  Variants:           {}", stats.variants);

    if !stats.origins.is_empty() {
        println!();
        println!("  By origin:");
        println!(
            "  {:<24} {:>10} {:>10} {:>7}   {}",
            "ORIGIN", "REFS", "RECORDS", "SHARE", "LAST UPDATE"
        );
        println!("  {}", "-".repeat(72));
        for o in &stats.origins {
            let updated = match o.last_update_ts {
                Some(ts) => format_age(ts, now),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>10} {:>10} {:>7}   {}",
                o.origin,
                o.references,
                o.catalog_records,
                format_share(o.references, stats.source_references),
                updated
            );
        }
    }
    println!();
    Ok(())
}

/// Database file size in KiB/MiB/GiB.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Share of all source references held by one origin.
fn format_share(part: i64, total: i64) -> String {
    if total <= 0 {
        return "-".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

/// Compact age of the last sync touching an origin, relative to `now`.
/// Anything older than a week, or in the future, prints as a UTC date.
fn format_age(ts: i64, now: i64) -> String {
    let age = now - ts;
    match age {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", age / 60),
        3600..=86_399 => format!("{}h ago", age / 3600),
        86_400..=604_799 => format!("{}d ago", age / 86_400),
        _ => chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| ts.to_string()),
    }
}
