//! Concurrent dispatch of NDJSON records to a caller-supplied callback.
//!
//! A walk reads each source sequentially on one coordinating task and hands
//! every record to the callback on its own tokio task. At most
//! [`WalkOptions::workers`] callbacks run at once. The first failure stops
//! dispatch for the stream, lets in-flight callbacks finish, and is returned;
//! remaining sources are skipped.
use async_trait::async_trait;
use async_zip::tokio::read::seek::ZipFileReader;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::io::{classify, SourceKind};
use crate::reader::{RecordFilter, RecordReader, WalkOptions};
use crate::source::open_uri_with;
use crate::{IngestError, IngestResult, Record, WalkError};

/// Callback invoked once per record with the walk's cancellation token and the
/// record body. Invocations run concurrently and in no particular order.
pub type WalkCallback =
    Arc<dyn Fn(CancellationToken, Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Box an async closure into a [`WalkCallback`].
pub fn callback<F, Fut>(f: F) -> WalkCallback
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, body| Box::pin(f(ctx, body)))
}

/// Walks NDJSON sources, dispatching every record to a callback.
#[async_trait]
pub trait Walker: Send + Sync {
    /// Walk each URI in order: `.zip` archives member by member, anything
    /// else as a single stream. Stops at the first error. Returns `Ok(())`
    /// early if `ctx` is cancelled.
    async fn walk_uris(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        uris: &[String],
    ) -> IngestResult<()>;

    /// Walk a single (possibly compressed) file or URL.
    async fn walk_file(&self, ctx: &CancellationToken, cb: &WalkCallback, uri: &str)
        -> IngestResult<()>;

    /// Walk every file member of a zip archive.
    async fn walk_zip_file(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        uri: &str,
    ) -> IngestResult<()>;

    /// Walk an already-open stream; `path` is used to attribute records and errors.
    async fn walk_reader<'r>(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        reader: Box<dyn AsyncRead + Unpin + Send + 'r>,
        path: &str,
    ) -> IngestResult<()>;
}

/// [`Walker`] for newline-delimited JSON, registered as `ndjson://`.
///
/// ```text
/// ndjson://?workers=50&validate=true&compression=bzip2
/// ```
///
/// - `workers`: maximum concurrent callbacks (default 100)
/// - `validate`: parse and re-serialize every line
/// - `format`: pretty-print every record
/// - `compression`: `bzip2`, `gzip` or `zstd`; inferred from the file suffix if absent
#[derive(Debug, Clone)]
pub struct NdjsonWalker {
    options: WalkOptions,
    client: reqwest::Client,
}

impl Default for NdjsonWalker {
    fn default() -> Self {
        Self::new(WalkOptions::default())
    }
}

impl NdjsonWalker {
    pub fn new(options: WalkOptions) -> Self {
        Self {
            options,
            client: reqwest::Client::new(),
        }
    }

    /// Build a walker from an `ndjson://` URI's query parameters.
    pub fn from_uri(uri: &Url) -> IngestResult<Self> {
        let mut options = WalkOptions::default();

        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "workers" => {
                    options.workers = value
                        .parse::<usize>()
                        .ok()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| invalid_parameter("workers", &value))?;
                }
                "validate" => options.validate_json = parse_flag("validate", &value)?,
                "format" => options.format_json = parse_flag("format", &value)?,
                "compression" => options.compression = Some(value.parse()?),
                other => tracing::debug!(parameter = other, "ignoring unknown walker parameter"),
            }
        }

        Ok(Self::new(options))
    }

    pub(crate) fn construct(uri: &Url) -> IngestResult<Box<dyn Walker>> {
        Ok(Box::new(Self::from_uri(uri)?))
    }

    /// Only forward records for which `filter` returns true.
    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.options.filter = Some(filter);
        self
    }

    /// Use `client` for remote sources.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    async fn walk_stream<R>(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        reader: R,
        options: WalkOptions,
    ) -> IngestResult<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = options.path.clone();
        let permits = Arc::new(Semaphore::new(options.workers.max(1)));
        tracing::debug!(path = %path, workers = options.workers, "walking stream");

        let records = RecordReader::new(reader, options);
        let dispatched = dispatch(ctx, records, cb, &permits).await?;

        tracing::info!(path = %path, records = dispatched, "finished stream");
        Ok(())
    }
}

fn invalid_parameter(name: &str, value: &str) -> IngestError {
    IngestError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn parse_flag(name: &str, value: &str) -> IngestResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_parameter(name, value)),
    }
}

#[async_trait]
impl Walker for NdjsonWalker {
    async fn walk_uris(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        uris: &[String],
    ) -> IngestResult<()> {
        for uri in uris {
            if ctx.is_cancelled() {
                tracing::debug!(uri = %uri, "walk cancelled, skipping remaining sources");
                return Ok(());
            }

            match classify(uri) {
                SourceKind::ZipArchive => self.walk_zip_file(ctx, cb, uri).await?,
                SourceKind::Plain | SourceKind::BlockCompressed(_) => {
                    self.walk_file(ctx, cb, uri).await?
                }
            }
        }
        Ok(())
    }

    async fn walk_file(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        uri: &str,
    ) -> IngestResult<()> {
        let (mut source, _size) = open_uri_with(&self.client, uri)
            .await
            .map_err(|e| WalkError::new(uri, 0, e))?;

        let walked = self
            .walk_stream(ctx, cb, &mut source, self.options.for_path(uri))
            .await;
        let closed = source.close().await;

        walked?;
        closed.map_err(|e| WalkError::new(uri, 0, e))?;
        Ok(())
    }

    async fn walk_zip_file(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        uri: &str,
    ) -> IngestResult<()> {
        let (source, size) = open_uri_with(&self.client, uri)
            .await
            .map_err(|e| WalkError::new(uri, 0, e))?;

        // The central directory sits at the end of the archive, so this seeks
        // (range requests for remote archives) rather than reading it all.
        let mut archive = ZipFileReader::with_tokio(BufReader::new(source))
            .await
            .map_err(|e| WalkError::new(uri, 0, e))?;
        let members = archive.file().entries().len();
        tracing::debug!(uri, size, members, "opened zip archive");

        for index in 0..members {
            if ctx.is_cancelled() {
                tracing::debug!(uri, "walk cancelled, skipping remaining members");
                break;
            }

            let Some(entry) = archive.file().entries().get(index) else {
                break;
            };
            let name = entry
                .filename()
                .as_str()
                .map_err(|e| WalkError::new(uri, 0, e))?
                .to_string();
            if entry.dir().map_err(|e| WalkError::new(uri, 0, e))? {
                continue;
            }

            let mut options = self.options.for_path(format!("{uri}#{name}"));
            if options.compression.is_none() {
                if let SourceKind::BlockCompressed(codec) = classify(&name) {
                    options.compression = Some(codec);
                }
            }

            let member = archive
                .reader_without_entry(index)
                .await
                .map_err(|e| WalkError::new(options.path.clone(), 0, e))?;
            self.walk_stream(ctx, cb, Box::pin(member.compat()), options)
                .await?;
        }

        Ok(())
    }

    async fn walk_reader<'r>(
        &self,
        ctx: &CancellationToken,
        cb: &WalkCallback,
        reader: Box<dyn AsyncRead + Unpin + Send + 'r>,
        path: &str,
    ) -> IngestResult<()> {
        self.walk_stream(ctx, cb, reader, self.options.for_path(path))
            .await
    }
}

/// Pull records from `records` and run `cb` on each under a permit from
/// `permits`. Returns the number of records dispatched.
///
/// Dispatch stops at the first reader or callback error (which is returned
/// once all in-flight callbacks have finished) or when `ctx` is cancelled
/// (which is not an error).
pub(crate) async fn dispatch(
    ctx: &CancellationToken,
    mut records: RecordReader<'_>,
    cb: &WalkCallback,
    permits: &Arc<Semaphore>,
) -> IngestResult<u64> {
    let stream_ctx = ctx.child_token();
    let path = records.path().to_string();
    let mut tasks: JoinSet<Result<(), WalkError>> = JoinSet::new();
    let mut failure: Option<WalkError> = None;
    let mut dispatched = 0u64;

    loop {
        while let Some(joined) = tasks.try_join_next() {
            note_outcome(joined, &path, &mut failure, &stream_ctx);
        }
        if failure.is_some() || stream_ctx.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = stream_ctx.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            biased;
            _ = stream_ctx.cancelled() => break,
            next = records.next() => next,
        };

        let record = match next {
            None => break,
            Some(Ok(record)) => record,
            Some(Err(e)) if e.is_end_of_stream() => break,
            Some(Err(e)) => {
                failure = Some(e);
                stream_ctx.cancel();
                break;
            }
        };

        dispatched += 1;
        let cb = cb.clone();
        let task_ctx = stream_ctx.clone();
        tasks.spawn(async move {
            let Record { path, line, body } = record;
            let outcome = cb(task_ctx.clone(), body)
                .await
                .map_err(|e| WalkError::new(path, line, IngestError::Callback(e)));
            // Cancel before the permit is released so the coordinator never
            // dispatches into a failed stream.
            if outcome.is_err() {
                task_ctx.cancel();
            }
            drop(permit);
            outcome
        });
    }

    while let Some(joined) = tasks.join_next().await {
        note_outcome(joined, &path, &mut failure, &stream_ctx);
    }

    match failure {
        Some(e) => {
            tracing::debug!(path = %path, error = %e, "stream aborted");
            Err(e.into())
        }
        None => Ok(dispatched),
    }
}

/// Keep the first real failure and stop further dispatch when one arrives.
fn note_outcome(
    joined: Result<Result<(), WalkError>, JoinError>,
    path: &str,
    failure: &mut Option<WalkError>,
    ctx: &CancellationToken,
) {
    let err = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) if e.is_end_of_stream() => return,
        Ok(Err(e)) => e,
        Err(e) if e.is_cancelled() => return,
        Err(e) => WalkError::new(path, 0, e),
    };

    ctx.cancel();
    if failure.is_none() {
        *failure = Some(err);
    } else {
        tracing::debug!(path, error = %err, "suppressing error after first failure");
    }
}
