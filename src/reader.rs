//! Turns a byte stream into numbered NDJSON records.
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::codec::{Line, LineCodec};
use crate::io::{build_record_stream, classify, Compression, SourceKind};
use crate::{IngestError, Record, WalkError};

/// Predicate deciding whether a record body is forwarded.
pub type RecordFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Default number of concurrent callback invocations.
pub const DEFAULT_WORKERS: usize = 100;

/// Immutable configuration for one walk.
#[derive(Clone)]
pub struct WalkOptions {
    /// Maximum number of callbacks in flight.
    pub workers: usize,
    /// Parse every line as JSON and forward its compact serialization.
    pub validate_json: bool,
    /// Forward pretty-printed JSON.
    pub format_json: bool,
    /// Decompress with this codec. `None` infers it from `path`.
    pub compression: Option<Compression>,
    pub filter: Option<RecordFilter>,
    /// Source the records come from, used in records and errors.
    pub path: String,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            validate_json: false,
            format_json: false,
            compression: None,
            filter: None,
            path: String::new(),
        }
    }
}

impl fmt::Debug for WalkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkOptions")
            .field("workers", &self.workers)
            .field("validate_json", &self.validate_json)
            .field("format_json", &self.format_json)
            .field("compression", &self.compression)
            .field("filter", &self.filter.is_some())
            .field("path", &self.path)
            .finish()
    }
}

impl WalkOptions {
    /// The same options, attributed to another source.
    pub fn for_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Codec to apply: the configured one, else whatever the path suffix says.
    pub fn effective_compression(&self) -> Option<Compression> {
        self.compression.or(match classify(&self.path) {
            SourceKind::BlockCompressed(codec) => Some(codec),
            _ => None,
        })
    }
}

/// Reads newline-delimited records from a stream.
///
/// Line numbers count every line, including ones that are filtered out or fail
/// validation, so they always match the source.
pub struct RecordReader<'a> {
    lines: FramedRead<Box<dyn AsyncRead + Unpin + Send + 'a>, LineCodec>,
    options: WalkOptions,
    line: u64,
    done: bool,
}

impl<'a> RecordReader<'a> {
    pub fn new<R>(reader: R, options: WalkOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'a,
    {
        let stream = build_record_stream(reader, options.effective_compression());
        Self {
            lines: FramedRead::with_capacity(stream, LineCodec::new(), 1 << 16),
            options,
            line: 0,
            done: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.options.path
    }

    /// Number of lines consumed so far.
    pub fn lines_read(&self) -> u64 {
        self.line
    }

    /// The next record or line error; `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<Result<Record, WalkError>> {
        while !self.done {
            let body = match self.lines.next().await? {
                Ok(Line::Complete(body)) => body,
                Ok(Line::Truncated(dropped)) => {
                    tracing::warn!(
                        path = %self.options.path,
                        line = self.line + 1,
                        bytes = dropped,
                        "ignoring unterminated final line"
                    );
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    // The underlying reader can't be resumed after a failure.
                    self.done = true;
                    // A clean end goes through the codec's EOF path, so
                    // UnexpectedEof here is truncated input.
                    let source = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        IngestError::ShortRead(e.to_string())
                    } else {
                        IngestError::Io(e)
                    };
                    return Some(Err(WalkError::new(
                        self.options.path.clone(),
                        self.line + 1,
                        source,
                    )));
                }
            };

            self.line += 1;
            match self.prepare(body) {
                Ok(Some(body)) => {
                    return Some(Ok(Record {
                        path: self.options.path.clone(),
                        line: self.line,
                        body,
                    }))
                }
                Ok(None) => continue,
                Err(e) => return Some(Err(WalkError::new(self.options.path.clone(), self.line, e))),
            }
        }
        None
    }

    /// Apply validation, filtering and formatting to one line.
    fn prepare(&self, body: Bytes) -> Result<Option<Bytes>, IngestError> {
        let opts = &self.options;

        let mut value = None;
        let body = if opts.validate_json {
            let parsed: serde_json::Value = serde_json::from_slice(&body)?;
            let compact = Bytes::from(serde_json::to_vec(&parsed)?);
            value = Some(parsed);
            compact
        } else {
            body
        };

        if let Some(filter) = &opts.filter {
            if !filter(&body) {
                return Ok(None);
            }
        }

        if opts.format_json {
            let parsed = match value {
                Some(v) => v,
                None => serde_json::from_slice(&body)?,
            };
            return Ok(Some(Bytes::from(serde_json::to_vec_pretty(&parsed)?)));
        }

        Ok(Some(body))
    }

    /// Drain into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record, WalkError>> + Send + 'a {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}
