//! Seekable reads over HTTP range requests.
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use url::Url;

use crate::{IngestError, IngestResult};

/// Bytes fetched per range request.
pub(crate) const DEFAULT_CHUNK_SIZE: u64 = 1 << 20;

/// Ask the server for the size of `url` without fetching the body.
pub(crate) async fn probe_size(client: &Client, url: &Url) -> IngestResult<u64> {
    let rsp = client
        .head(url.clone())
        .send()
        .await
        .map_err(|source| IngestError::Http {
            url: url.to_string(),
            source,
        })?;

    if !rsp.status().is_success() {
        return Err(IngestError::HttpStatus {
            url: url.to_string(),
            status: rsp.status(),
        });
    }

    // `Response::content_length` reflects the (empty) HEAD body, so read the header.
    rsp.headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| IngestError::MissingContentLength(url.to_string()))
}

async fn fetch_range(client: Client, url: Url, start: u64, end: u64) -> IngestResult<Bytes> {
    let rsp = client
        .get(url.clone())
        .header(RANGE, format!("bytes={start}-{end}"))
        .send()
        .await
        .map_err(|source| IngestError::Http {
            url: url.to_string(),
            source,
        })?;

    let status = rsp.status();
    let body = rsp.bytes().await.map_err(|source| IngestError::Http {
        url: url.to_string(),
        source,
    })?;

    match status {
        StatusCode::PARTIAL_CONTENT => Ok(body),
        // Server ignored the range and sent everything.
        StatusCode::OK => {
            let len = body.len() as u64;
            let from = start.min(len) as usize;
            let to = (end + 1).min(len) as usize;
            Ok(body.slice(from..to))
        }
        status => Err(IngestError::HttpStatus {
            url: url.to_string(),
            status,
        }),
    }
}

/// `AsyncRead + AsyncSeek` over a remote resource of known size.
///
/// Reads are served from the last fetched chunk; a read outside it issues a new
/// range request starting at the current position.
pub struct RemoteReader {
    client: Client,
    url: Url,
    size: u64,
    pos: u64,
    buf: Bytes,
    buf_start: u64,
    chunk_size: u64,
    pending: Option<BoxFuture<'static, IngestResult<(u64, Bytes)>>>,
}

impl RemoteReader {
    pub(crate) fn new(client: Client, url: Url, size: u64) -> Self {
        Self {
            client,
            url,
            size,
            pos: 0,
            buf: Bytes::new(),
            buf_start: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pending: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn buffered(&self) -> Option<&[u8]> {
        let end = self.buf_start + self.buf.len() as u64;
        if self.pos >= self.buf_start && self.pos < end {
            Some(&self.buf[(self.pos - self.buf_start) as usize..])
        } else {
            None
        }
    }
}

impl AsyncRead for RemoteReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pos >= this.size || out.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if let Some(avail) = this.buffered() {
                let n = avail.len().min(out.remaining());
                out.put_slice(&avail[..n]);
                this.pos += n as u64;
                return Poll::Ready(Ok(()));
            }

            if this.pending.is_none() {
                let start = this.pos;
                let end = (start + this.chunk_size).min(this.size) - 1;
                let fut = fetch_range(this.client.clone(), this.url.clone(), start, end);
                this.pending = Some(Box::pin(async move { fut.await.map(|bytes| (start, bytes)) }));
            }

            let polled = match this.pending.as_mut() {
                Some(fut) => fut.as_mut().poll(cx),
                None => continue,
            };

            match polled {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    this.pending = None;
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(Ok((start, bytes))) => {
                    this.pending = None;
                    if bytes.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            IngestError::ShortRead(format!(
                                "{} returned no data at offset {start} of {}",
                                this.url, this.size
                            )),
                        )));
                    }
                    this.buf_start = start;
                    this.buf = bytes;
                }
            }
        }
    }
}

impl AsyncSeek for RemoteReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => this.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => this.pos.checked_add_signed(delta),
        };
        match target {
            Some(pos) => {
                this.pos = pos;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}
