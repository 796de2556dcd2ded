//! Uniform random-access reads from local files and remote URLs.
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};
use url::Url;

use crate::remote::{probe_size, RemoteReader};
use crate::{IngestError, IngestResult};

/// Where a URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote(Url),
}

/// Resolve `uri` to a local path or a remote `http(s)` URL.
///
/// Plain paths (absolute or relative) are local; `file://` URLs are converted
/// to paths. Any other scheme is rejected.
pub fn locate(uri: &str) -> IngestResult<Location> {
    match Url::parse(uri) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(Location::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|_| IngestError::UnsupportedScheme("file".into())),
            // `C:\data\dump.ndjson` parses with a one-letter scheme.
            s if s.len() == 1 && cfg!(windows) => Ok(Location::Local(PathBuf::from(uri))),
            other => Err(IngestError::UnsupportedScheme(other.to_string())),
        },
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Location::Local(PathBuf::from(uri))),
        Err(source) => Err(IngestError::InvalidUri {
            uri: uri.to_string(),
            source,
        }),
    }
}

/// A closeable, seekable byte stream over a local file or a remote resource.
pub enum SourceReader {
    Local(File),
    Remote(RemoteReader),
}

impl SourceReader {
    /// Read up to `buf.len()` bytes starting at `offset`, leaving the stream
    /// positioned after the bytes read.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Release the underlying handle. Remote readers hold no connection, so
    /// this is a no-op for them.
    pub async fn close(self) -> io::Result<()> {
        match self {
            SourceReader::Local(file) => {
                drop(file.into_std().await);
                Ok(())
            }
            SourceReader::Remote(_) => Ok(()),
        }
    }
}

impl AsyncRead for SourceReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SourceReader::Local(f) => Pin::new(f).poll_read(cx, buf),
            SourceReader::Remote(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for SourceReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match self.get_mut() {
            SourceReader::Local(f) => Pin::new(f).start_seek(position),
            SourceReader::Remote(r) => Pin::new(r).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match self.get_mut() {
            SourceReader::Local(f) => Pin::new(f).poll_complete(cx),
            SourceReader::Remote(r) => Pin::new(r).poll_complete(cx),
        }
    }
}

/// Open `uri` and return a reader plus the total size of the resource.
///
/// For `http(s)://` URIs the size is the `Content-Length` declared in response
/// to a `HEAD` request; nothing is downloaded until the reader is read.
pub async fn open_uri(uri: &str) -> IngestResult<(SourceReader, u64)> {
    open_uri_with(&reqwest::Client::new(), uri).await
}

/// Like [`open_uri`], reusing an existing HTTP client.
pub async fn open_uri_with(
    client: &reqwest::Client,
    uri: &str,
) -> IngestResult<(SourceReader, u64)> {
    match locate(uri)? {
        Location::Local(path) => {
            let open_err = |source| IngestError::Open {
                path: path.display().to_string(),
                source,
            };
            let file = File::open(&path).await.map_err(open_err)?;
            let size = file.metadata().await.map_err(open_err)?.len();
            tracing::debug!(path = %path.display(), size, "opened local source");
            Ok((SourceReader::Local(file), size))
        }
        Location::Remote(url) => {
            let size = probe_size(client, &url).await?;
            tracing::debug!(url = %url, size, "opened remote source");
            Ok((
                SourceReader::Remote(RemoteReader::new(client.clone(), url, size)),
                size,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_paths_and_urls() {
        assert_eq!(
            locate("/data/lcsh.ndjson").unwrap(),
            Location::Local(PathBuf::from("/data/lcsh.ndjson"))
        );
        assert_eq!(
            locate("fixtures/lcsh.ndjson").unwrap(),
            Location::Local(PathBuf::from("fixtures/lcsh.ndjson"))
        );
        assert!(matches!(
            locate("https://id.loc.gov/download/lcsh.both.ndjson.zip").unwrap(),
            Location::Remote(_)
        ));
        assert!(matches!(
            locate("s3://bucket/key"),
            Err(IngestError::UnsupportedScheme(s)) if s == "s3"
        ));
        assert!(matches!(
            locate("http://[::1"),
            Err(IngestError::InvalidUri { .. })
        ));
    }
}
