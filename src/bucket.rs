//! Walking every object under a prefix of a hierarchical store.
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::reader::{RecordReader, WalkOptions};
use crate::walker::{dispatch, NdjsonWalker, WalkCallback};
use crate::{IngestError, IngestResult, WalkError};

/// Decides whether an object key is walked.
pub type KeyFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One result of listing a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    /// Full key. Directory keys end with `/`.
    pub key: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A store of objects addressed by `/`-separated keys.
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    /// Objects and directories directly under `prefix` (`""` for the root,
    /// otherwise a directory key ending in `/`).
    async fn list(&self, prefix: &str) -> IngestResult<Vec<BucketEntry>>;

    async fn open(&self, key: &str) -> IngestResult<Box<dyn AsyncRead + Unpin + Send>>;
}

/// [`Bucket`] over a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    async fn list(&self, prefix: &str) -> IngestResult<Vec<BucketEntry>> {
        let dir = self.root.join(prefix);
        let open_err = |source| IngestError::Open {
            path: dir.display().to_string(),
            source,
        };

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(open_err)?;
        while let Some(item) = read_dir.next_entry().await.map_err(open_err)? {
            let name = item.file_name().to_string_lossy().into_owned();
            let meta = item.metadata().await.map_err(open_err)?;
            if meta.is_dir() {
                entries.push(BucketEntry {
                    key: format!("{prefix}{name}/"),
                    size: 0,
                    is_dir: true,
                });
            } else {
                entries.push(BucketEntry {
                    key: format!("{prefix}{name}"),
                    size: meta.len(),
                    is_dir: false,
                });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn open(&self, key: &str) -> IngestResult<Box<dyn AsyncRead + Unpin + Send>> {
        let path = self.root.join(key);
        let file = File::open(&path).await.map_err(|source| IngestError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Box::new(file))
    }
}

/// Walk every non-empty object below `prefix`, descending into directories.
///
/// Up to `options.workers` objects are read at once, and up to
/// `options.workers` callbacks run at once across all of them. Returns after
/// every started object has finished, with the first error if any.
pub async fn walk_bucket(
    ctx: &CancellationToken,
    cb: &WalkCallback,
    bucket: Arc<dyn Bucket>,
    prefix: &str,
    options: &WalkOptions,
    key_filter: Option<KeyFilter>,
) -> IngestResult<()> {
    let walk_ctx = ctx.child_token();
    let workers = options.workers.max(1);
    let streams = Arc::new(Semaphore::new(workers));
    let callbacks = Arc::new(Semaphore::new(workers));
    let mut tasks: JoinSet<IngestResult<u64>> = JoinSet::new();
    let mut failure: Option<IngestError> = None;
    let mut prefixes = vec![prefix.to_string()];

    'listing: while let Some(prefix) = prefixes.pop() {
        if walk_ctx.is_cancelled() {
            break;
        }

        let entries = match bucket.list(&prefix).await {
            Ok(entries) => entries,
            Err(e) => {
                failure = Some(WalkError::new(prefix, 0, e).into());
                walk_ctx.cancel();
                break;
            }
        };

        for entry in entries {
            while let Some(joined) = tasks.try_join_next() {
                note_stream(joined, &mut failure, &walk_ctx);
            }
            if failure.is_some() || walk_ctx.is_cancelled() {
                break 'listing;
            }

            if entry.is_dir {
                prefixes.push(entry.key);
                continue;
            }
            if entry.size == 0 {
                continue;
            }
            if let Some(filter) = &key_filter {
                if !filter(&entry.key) {
                    continue;
                }
            }

            let permit = tokio::select! {
                biased;
                _ = walk_ctx.cancelled() => break 'listing,
                permit = streams.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'listing,
                },
            };

            let key = entry.key.trim_end_matches('/').to_string();
            let bucket = bucket.clone();
            let cb = cb.clone();
            let task_ctx = walk_ctx.clone();
            let callbacks = callbacks.clone();
            let stream_options = options.for_path(key.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let reader = bucket
                    .open(&key)
                    .await
                    .map_err(|e| WalkError::new(key.as_str(), 0, e))?;
                let records = RecordReader::new(reader, stream_options);
                let dispatched = dispatch(&task_ctx, records, &cb, &callbacks).await?;
                tracing::info!(key = %key, records = dispatched, "finished object");
                Ok::<_, IngestError>(dispatched)
            });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        note_stream(joined, &mut failure, &walk_ctx);
    }

    failure.map_or(Ok(()), Err)
}

fn note_stream(
    joined: Result<IngestResult<u64>, tokio::task::JoinError>,
    failure: &mut Option<IngestError>,
    ctx: &CancellationToken,
) {
    let err = match joined {
        Ok(Ok(_)) => return,
        Ok(Err(e)) if e.is_end_of_stream() => return,
        Ok(Err(e)) => e,
        Err(e) if e.is_cancelled() => return,
        Err(e) => e.into(),
    };

    ctx.cancel();
    if failure.is_none() {
        *failure = Some(err);
    }
}

impl NdjsonWalker {
    /// Walk `bucket` below `prefix` with this walker's options.
    pub async fn walk_bucket(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        bucket: Arc<dyn Bucket>,
        prefix: &str,
        key_filter: Option<KeyFilter>,
    ) -> IngestResult<()> {
        walk_bucket(ctx, cb, bucket, prefix, self.options(), key_filter).await
    }
}
