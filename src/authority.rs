//! Library of Congress authority dumps (LCSH subjects, LCNAF names) to
//! `id,label` CSV.
//!
//! Each NDJSON record is a JSON-LD document whose `@graph` holds the heading
//! and its related nodes. Only nodes inside the authority's own namespace with
//! a non-empty `madsrdf:authoritativeLabel` become rows, and every id is
//! written at most once per export.
use anyhow::Context;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::catalog::{open_catalog, Catalog};
use crate::registry::new_walker;
use crate::sink::CsvSink;
use crate::walker::{callback, Walker};
use crate::{IngestError, IngestResult};

/// CSV columns written by [`export`].
pub const COLUMNS: [&str; 2] = ["id", "label"];

const GRAPH: &str = "@graph";
const ID: &str = "@id";
const LABEL: &str = "madsrdf:authoritativeLabel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityKind {
    /// Library of Congress Subject Headings.
    Subjects,
    /// Library of Congress Name Authority File.
    Names,
}

impl AuthorityKind {
    /// Namespace a graph node's `@id` must start with.
    pub fn id_prefix(self) -> &'static str {
        match self {
            AuthorityKind::Subjects => "http://id.loc.gov/authorities/subjects/",
            AuthorityKind::Names => "http://id.loc.gov/authorities/names/",
        }
    }

    /// Catalog used when none is given. The name file has far more headings
    /// than fit comfortably in memory.
    pub fn default_catalog(self) -> &'static str {
        match self {
            AuthorityKind::Subjects => "memory://",
            AuthorityKind::Names => "tmp://",
        }
    }
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthorityKind::Subjects => "lcsh",
            AuthorityKind::Names => "lcnaf",
        })
    }
}

impl FromStr for AuthorityKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lcsh" | "subjects" => Ok(AuthorityKind::Subjects),
            "lcnaf" | "names" => Ok(AuthorityKind::Names),
            _ => Err(IngestError::InvalidParameter {
                name: "authority".into(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityRow {
    pub id: String,
    pub label: String,
}

/// Rows for one record, in graph order. Duplicates are not removed here.
pub fn extract_rows(body: &[u8], kind: AuthorityKind) -> IngestResult<Vec<AuthorityRow>> {
    let record: Value = serde_json::from_slice(body)?;
    let graph = record.get(GRAPH).ok_or(IngestError::MissingField(GRAPH))?;

    let nodes: &[Value] = match graph {
        Value::Array(items) => items,
        Value::Object(_) => std::slice::from_ref(graph),
        _ => &[],
    };

    let prefix = kind.id_prefix();
    let mut rows = Vec::new();
    for node in nodes {
        let Some(uri) = node.get(ID).and_then(Value::as_str) else {
            continue;
        };
        if !uri.starts_with(prefix) {
            continue;
        }
        let Some(id) = uri.trim_end_matches('/').rsplit('/').next() else {
            continue;
        };
        if id.is_empty() {
            continue;
        }
        let Some(label) = node.get(LABEL).and_then(label_text) else {
            continue;
        };
        rows.push(AuthorityRow {
            id: id.to_string(),
            label: label.to_string(),
        });
    }
    Ok(rows)
}

/// `"x"`, `{"@value": "x", "@language": "en"}`, or the first non-empty of a
/// list of those.
fn label_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()).filter(|s| !s.is_empty()),
        Value::Object(map) => map.get("@value").and_then(label_text),
        Value::Array(items) => items.iter().find_map(label_text),
        _ => None,
    }
}

/// What an export wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: u64,
    /// Rows skipped because their id had already been written.
    pub duplicates: u64,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub kind: AuthorityKind,
    /// Walker URI, e.g. `ndjson://?workers=50&validate=true`.
    pub walker_uri: String,
    /// Catalog URI, e.g. `tmp://` or `memory://`.
    pub catalog_uri: String,
}

impl ExportConfig {
    pub fn new(kind: AuthorityKind) -> Self {
        Self {
            kind,
            walker_uri: "ndjson://".to_string(),
            catalog_uri: kind.default_catalog().to_string(),
        }
    }
}

/// Walk `uris` and write one CSV row per distinct authority id to `writer`.
///
/// The catalog is closed before returning, on success and on failure. Rows
/// flushed before a failure stay written.
pub async fn export<W>(
    ctx: &CancellationToken,
    config: &ExportConfig,
    uris: &[String],
    writer: W,
) -> IngestResult<ExportSummary>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let walker = new_walker(&config.walker_uri)?;
    let catalog = open_catalog(&config.catalog_uri).await?;
    let sink = Arc::new(CsvSink::new(writer, COLUMNS));

    let exported = export_with(
        ctx,
        walker.as_ref(),
        catalog.clone(),
        sink.clone(),
        config.kind,
        uris,
    )
    .await;
    let closed = catalog.close().await;
    let flushed = sink.flush().await;

    let summary = exported?;
    closed?;
    flushed?;
    tracing::info!(
        authority = %config.kind,
        rows = summary.rows,
        duplicates = summary.duplicates,
        "export complete"
    );
    Ok(summary)
}

/// [`export`] with caller-provided parts. Writes the header, then rows; does
/// not close `catalog`.
pub async fn export_with<W>(
    ctx: &CancellationToken,
    walker: &dyn Walker,
    catalog: Arc<dyn Catalog>,
    sink: Arc<CsvSink<W>>,
    kind: AuthorityKind,
    uris: &[String],
) -> IngestResult<ExportSummary>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    sink.write_header().await?;
    sink.flush().await?;

    let rows = Arc::new(AtomicU64::new(0));
    let duplicates = Arc::new(AtomicU64::new(0));

    let cb = {
        let rows = rows.clone();
        let duplicates = duplicates.clone();
        callback(move |_ctx, body| {
            let catalog = catalog.clone();
            let sink = sink.clone();
            let rows = rows.clone();
            let duplicates = duplicates.clone();
            async move {
                for row in extract_rows(&body, kind)? {
                    let seen = catalog
                        .exists_or_store(&row.id)
                        .await
                        .with_context(|| format!("failed to check whether {} exists", row.id))?;
                    if seen {
                        duplicates.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    sink.write_row([row.id.as_str(), row.label.as_str()])
                        .await
                        .with_context(|| format!("failed to write {} ({})", row.id, row.label))?;
                    rows.fetch_add(1, Ordering::Relaxed);
                }
                sink.flush().await?;
                Ok::<_, anyhow::Error>(())
            }
        })
    };

    walker.walk_uris(ctx, &cb, uris).await?;

    Ok(ExportSummary {
        rows: rows.load(Ordering::Relaxed),
        duplicates: duplicates.load(Ordering::Relaxed),
    })
}
