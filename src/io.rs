use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, ZstdDecoder};
use std::str::FromStr;
use tokio::io::{AsyncRead, BufReader};

use crate::IngestError;

/// Block compression codecs understood by the record reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Bzip2,
    Gzip,
    Zstd,
}

impl FromStr for Compression {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "zstd" | "zst" => Ok(Compression::Zstd),
            _ => Err(IngestError::InvalidParameter {
                name: "compression".into(),
                value: s.to_string(),
            }),
        }
    }
}

/// How a source has to be opened, decided from its path alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Plain,
    ZipArchive,
    BlockCompressed(Compression),
}

/// Classify a local path, URL or archive member name by its suffix.
///
/// Query strings and fragments are ignored so that
/// `https://host/dump.ndjson.zip?sig=...` is still an archive.
pub fn classify(path: &str) -> SourceKind {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    let name = path[..end].to_ascii_lowercase();

    if name.ends_with(".zip") {
        SourceKind::ZipArchive
    } else if name.ends_with(".bz2") {
        SourceKind::BlockCompressed(Compression::Bzip2)
    } else if name.ends_with(".gz") {
        SourceKind::BlockCompressed(Compression::Gzip)
    } else if name.ends_with(".zst") {
        SourceKind::BlockCompressed(Compression::Zstd)
    } else {
        SourceKind::Plain
    }
}

/// Wrap a raw stream with a 1 MiB buffer and, if needed, a decompressor.
pub(crate) fn build_record_stream<'a, R>(
    raw: R,
    compression: Option<Compression>,
) -> Box<dyn AsyncRead + Unpin + Send + 'a>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    // Use a larger buffer for fewer syscalls (1 MiB)
    let buf = BufReader::with_capacity(1 << 20, raw);
    // Parallel compressors (pbzip2, pigz) write concatenated members.
    match compression {
        Some(Compression::Bzip2) => {
            let mut decoder = BzDecoder::new(buf);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        Some(Compression::Gzip) => {
            let mut decoder = GzipDecoder::new(buf);
            decoder.multiple_members(true);
            Box::new(decoder)
        }
        Some(Compression::Zstd) => Box::new(ZstdDecoder::new(buf)),
        None => Box::new(buf),
    }
}
