//! Producer-side collaborators.
//!
//! A [`CatalogSource`] yields the raw metadata of one content category as a
//! lazy, finite sequence of pages. The pipeline never assumes a total size:
//! `Ok(None)` is a clean end of stream, `Err(_)` is a category-level failure
//! that stops that category only.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use catalog_ingest::models::RawRecord;
//! use catalog_ingest::source::CatalogSource;
//!
//! pub struct LiveChannels {
//!     pages: Vec<Vec<RawRecord>>,
//! }
//!
//! #[async_trait]
//! impl CatalogSource for LiveChannels {
//!     fn category(&self) -> &str { "live" }
//!
//!     async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
//!         Ok(self.pages.pop())
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{CategoryConfig, Config};
use crate::models::RawRecord;

#[async_trait]
pub trait CatalogSource: Send {
    /// Category name. Used as the origin tag of source references and as the
    /// key of the category's report.
    fn category(&self) -> &str;

    /// Pull the next page of raw records, `Ok(None)` at end of stream.
    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>>;
}

/// Reads one JSON object per line from a file, `page_size` lines per page.
///
/// Blank lines are skipped. A line that is not valid UTF-8 or not a valid
/// record is passed on as an empty record so that validation counts it
/// instead of failing the whole category. A read error ends the stream, but
/// only after the records already read have been returned.
pub struct JsonlFileSource {
    category: String,
    path: PathBuf,
    page_size: usize,
    reader: Option<BufReader<File>>,
    line_no: usize,
    done: bool,
    read_error: Option<anyhow::Error>,
}

impl JsonlFileSource {
    pub fn new(category: impl Into<String>, path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            category: category.into(),
            path: path.into(),
            page_size: page_size.max(1),
            reader: None,
            line_no: 0,
            done: false,
            read_error: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogSource for JsonlFileSource {
    fn category(&self) -> &str {
        &self.category
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        if let Some(err) = self.read_error.take() {
            return Err(err);
        }
        if self.done {
            return Ok(None);
        }
        if self.reader.is_none() {
            let file = File::open(&self.path)
                .await
                .with_context(|| format!("Failed to open feed: {}", self.path.display()))?;
            self.reader = Some(BufReader::new(file));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        let mut page = Vec::with_capacity(self.page_size);
        let mut buf = Vec::new();
        while page.len() < self.page_size {
            buf.clear();
            let read = match reader.read_until(b'\n', &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    let err = anyhow::Error::new(e)
                        .context(format!("Failed to read feed: {}", self.path.display()));
                    if page.is_empty() {
                        return Err(err);
                    }
                    self.read_error = Some(err);
                    break;
                }
            };
            if read == 0 {
                self.done = true;
                break;
            }
            self.line_no += 1;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    tracing::warn!(
                        category = %self.category,
                        line = self.line_no,
                        error = %e,
                        "feed line is not valid UTF-8"
                    );
                    page.push(RawRecord::default());
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawRecord>(line) {
                Ok(record) => page.push(record),
                Err(e) => {
                    tracing::warn!(
                        category = %self.category,
                        line = self.line_no,
                        error = %e,
                        "unparseable feed line"
                    );
                    page.push(RawRecord::default());
                }
            }
        }

        if page.is_empty() && self.done {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

/// Source over pre-built pages. An `Err` page ends the stream with that
/// error, like a remote source failing midway.
pub struct PagedSource {
    category: String,
    pages: VecDeque<std::result::Result<Vec<RawRecord>, String>>,
}

impl PagedSource {
    pub fn new(category: impl Into<String>, pages: Vec<Vec<RawRecord>>) -> Self {
        Self {
            category: category.into(),
            pages: pages.into_iter().map(Ok).collect(),
        }
    }

    /// Append a failing page after the pages already queued.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.pages.push_back(Err(message.into()));
        self
    }
}

#[async_trait]
impl CatalogSource for PagedSource {
    fn category(&self) -> &str {
        &self.category
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        match self.pages.pop_front() {
            Some(Ok(page)) => Ok(Some(page)),
            Some(Err(message)) => {
                self.pages.clear();
                anyhow::bail!("{}", message)
            }
            None => Ok(None),
        }
    }
}

/// Build the file sources configured under `[[categories]]`, optionally
/// restricted to the named categories.
pub fn sources_from_config(
    config: &Config,
    only: &[String],
) -> Result<Vec<Box<dyn CatalogSource>>> {
    let selected: Vec<&CategoryConfig> = config
        .categories
        .iter()
        .filter(|c| only.is_empty() || only.iter().any(|o| o == &c.name))
        .collect();

    for name in only {
        if !config.categories.iter().any(|c| &c.name == name) {
            let available: Vec<&str> = config.categories.iter().map(|c| c.name.as_str()).collect();
            anyhow::bail!(
                "Unknown category: '{}'. Available: {}",
                name,
                available.join(", ")
            );
        }
    }

    Ok(selected
        .into_iter()
        .map(|c| {
            Box::new(JsonlFileSource::new(
                c.name.clone(),
                c.path.clone(),
                config.source.page_size,
            )) as Box<dyn CatalogSource>
        })
        .collect())
}
