//! Core data models used throughout the catalog ingestion pipeline.
//!
//! A [`CatalogSource`](crate::source::CatalogSource) yields [`RawRecord`]s.
//! Producers map each raw record into a [`Candidate`] (one of the three
//! persisted record kinds) which then flows through deduplication, the
//! backpressure buffer and the transactional upsert store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The three persisted record kinds. Each has its own table and key space.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[default]
    #[serde(alias = "record")]
    Catalog,
    #[serde(alias = "reference")]
    Source,
    Variant,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Catalog => "catalog",
            RecordKind::Source => "source",
            RecordKind::Variant => "variant",
        }
    }
}

/// Raw metadata record produced by a source before mapping.
///
/// The JSON-Lines file source deserializes one of these per line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    /// Explicit owner key for source references and variants. When absent the
    /// owner is derived from `media_type`, `title` and `year`.
    #[serde(default)]
    pub catalog_key: Option<String>,
    /// Free-form metadata blob (catalog records) or technical descriptors
    /// (variants).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_media_type() -> String {
    "movie".to_string()
}

/// A canonical content entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogRecord {
    pub key: String,
    pub title: String,
    pub year: Option<i64>,
    pub media_type: String,
    pub metadata: serde_json::Value,
}

/// Maps one source-specific identifier onto a [`CatalogRecord`] by key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReference {
    pub source_key: String,
    pub catalog_key: String,
    pub origin: String,
}

/// A rendition of a [`CatalogRecord`] (quality, resolution, language track).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub variant_key: String,
    pub catalog_key: String,
    pub descriptors: serde_json::Value,
}

/// A record of any kind on its way to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Candidate {
    Catalog(CatalogRecord),
    Source(SourceReference),
    Variant(Variant),
}

impl Candidate {
    /// Map a raw record from `origin` (the category name) into a candidate.
    ///
    /// Mapping never fails: malformed input yields a candidate that the
    /// store's validation rejects and counts.
    pub fn from_raw(origin: &str, raw: RawRecord) -> Candidate {
        let derived = catalog_key(&raw.media_type, &raw.title, raw.year);
        let owner = raw
            .catalog_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or(derived.clone());

        match raw.kind {
            RecordKind::Catalog => Candidate::Catalog(CatalogRecord {
                key: derived,
                title: raw.title.trim().to_string(),
                year: raw.year,
                media_type: raw.media_type,
                metadata: raw.metadata,
            }),
            RecordKind::Source => Candidate::Source(SourceReference {
                source_key: if raw.external_id.trim().is_empty() {
                    String::new()
                } else {
                    format!("{}:{}", origin, raw.external_id.trim())
                },
                catalog_key: owner,
                origin: origin.to_string(),
            }),
            RecordKind::Variant => Candidate::Variant(Variant {
                variant_key: if raw.external_id.trim().is_empty() || owner.is_empty() {
                    String::new()
                } else {
                    format!("{}#{}", owner, raw.external_id.trim())
                },
                catalog_key: owner,
                descriptors: raw.metadata,
            }),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Candidate::Catalog(_) => RecordKind::Catalog,
            Candidate::Source(_) => RecordKind::Source,
            Candidate::Variant(_) => RecordKind::Variant,
        }
    }

    /// The unique business key within this candidate's kind.
    pub fn key(&self) -> &str {
        match self {
            Candidate::Catalog(r) => &r.key,
            Candidate::Source(r) => &r.source_key,
            Candidate::Variant(r) => &r.variant_key,
        }
    }

    /// SHA-256 over the canonical payload, stored alongside each row.
    pub fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_str().as_bytes());
        match self {
            Candidate::Catalog(r) => {
                hasher.update(r.key.as_bytes());
                hasher.update(r.title.as_bytes());
                hasher.update(r.year.unwrap_or_default().to_le_bytes());
                hasher.update(r.media_type.as_bytes());
                hasher.update(r.metadata.to_string().as_bytes());
            }
            Candidate::Source(r) => {
                hasher.update(r.source_key.as_bytes());
                hasher.update(r.catalog_key.as_bytes());
                hasher.update(r.origin.as_bytes());
            }
            Candidate::Variant(r) => {
                hasher.update(r.variant_key.as_bytes());
                hasher.update(r.catalog_key.as_bytes());
                hasher.update(r.descriptors.to_string().as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Derive the stable catalog key `"{media_type}:{title}:{year}"`.
///
/// Titles are lower-cased with whitespace collapsed. An empty title yields an
/// empty key.
pub fn catalog_key(media_type: &str, title: &str, year: Option<i64>) -> String {
    let normalized = title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if normalized.is_empty() {
        return String::new();
    }
    let year = year.map(|y| y.to_string()).unwrap_or_else(|| "-".to_string());
    format!("{}:{}:{}", media_type.trim().to_lowercase(), normalized, year)
}

/// One batch of candidates of a single kind, produced by one pipeline cycle.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub kind: RecordKind,
    pub records: Vec<Candidate>,
}

impl IngestBatch {
    /// Split a mixed sequence into per-kind batches, preserving order within
    /// each kind. Batches come back in `Catalog`, `Source`, `Variant` order so
    /// owners are enqueued ahead of the rows that reference them.
    pub fn partition(records: Vec<Candidate>) -> Vec<IngestBatch> {
        let mut batches: Vec<IngestBatch> = [RecordKind::Catalog, RecordKind::Source, RecordKind::Variant]
            .into_iter()
            .map(|kind| IngestBatch {
                kind,
                records: Vec::new(),
            })
            .collect();
        for record in records {
            let slot = match record.kind() {
                RecordKind::Catalog => 0,
                RecordKind::Source => 1,
                RecordKind::Variant => 2,
            };
            batches[slot].records.push(record);
        }
        batches.retain(|b| !b.records.is_empty());
        batches
    }
}
