//! Concurrent streaming walker for large NDJSON dumps.
//!
//! - Sources: local files, `http(s)://` URLs (range requests), zip archives,
//!   bzip2/gzip/zstd compressed streams.
//! - Records are dispatched to a caller callback through a bounded worker pool;
//!   the first error aborts the walk.
//! - `Catalog` deduplicates keys on disk (SQLite) or in memory.
//!
//! Data shape:
//! - `Record { path, line, body }` (body is `bytes::Bytes`, terminator stripped)
//! - `WalkError { path, line, source }`
#![cfg_attr(docsrs, feature(doc_cfg))]
//
pub mod authority;
pub mod bucket;
pub mod catalog;
mod codec;
mod io;
pub mod reader;
pub mod registry;
mod remote;
pub mod sink;
pub mod source;
pub mod walker;

pub use crate::bucket::{Bucket, BucketEntry, KeyFilter, LocalBucket};
pub use crate::catalog::{open_catalog, Catalog, MemoryCatalog, SqliteCatalog};
pub use crate::io::{classify, Compression, SourceKind};
pub use crate::reader::{RecordFilter, RecordReader, WalkOptions};
pub use crate::registry::{new_walker, register_walker, schemes, WalkerRegistry};
pub use crate::sink::CsvSink;
pub use crate::source::{open_uri, SourceReader};
pub use crate::walker::{callback, NdjsonWalker, WalkCallback, Walker};

use bytes::Bytes;
use thiserror::Error;

/// One line of a source, moved into exactly one callback invocation.
#[derive(Debug, Clone)]
pub struct Record {
    pub path: String,
    /// 1-based line number within `path`.
    pub line: u64,
    pub body: Bytes,
}

/// Error type returned by this crate.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid URI '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URI scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{0} did not declare a usable content length")]
    MissingContentLength(String),
    #[error("stream ended early: {0}")]
    ShortRead(String),
    #[error("failed to read zip archive: {0}")]
    Zip(#[from] async_zip::error::ZipError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is missing the {0} property")]
    MissingField(&'static str),
    #[error("catalog failure: {0}")]
    Catalog(#[from] rusqlite::Error),
    #[error("key '{0}' is already present in the catalog")]
    DuplicateKey(String),
    #[error("catalog is closed")]
    CatalogClosed,
    #[error("walker scheme '{0}' is already registered")]
    SchemeRegistered(String),
    #[error("no walker registered for scheme '{0}'")]
    UnknownScheme(String),
    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },
    #[error("callback failed: {0:#}")]
    Callback(anyhow::Error),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Walk(Box<WalkError>),
}

impl IngestError {
    /// True for the end-of-stream condition, which is normal termination rather
    /// than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            IngestError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            IngestError::Walk(e) => e.is_end_of_stream(),
            _ => false,
        }
    }
}

impl From<WalkError> for IngestError {
    fn from(e: WalkError) -> Self {
        IngestError::Walk(Box::new(e))
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// A failure attributed to a source and, when line-specific, a line number.
#[derive(Debug, Error)]
#[error("[{path}] line {line}, {source}")]
pub struct WalkError {
    pub path: String,
    /// 0 when the failure is not tied to one line.
    pub line: u64,
    #[source]
    pub source: IngestError,
}

impl WalkError {
    pub fn new(path: impl Into<String>, line: u64, source: impl Into<IngestError>) -> Self {
        Self {
            path: path.into(),
            line,
            source: source.into(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.source.is_end_of_stream()
    }
}
