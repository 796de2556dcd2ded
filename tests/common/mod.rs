#![allow(dead_code)]

use async_zip::base::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::Bytes;
use ndjson_ingest::{callback, WalkCallback};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

/// `n` one-line JSON records `{"id":"<prefix>i","n":i}`.
pub fn ndjson(prefix: &str, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 1..=n {
        out.extend_from_slice(format!("{{\"id\":\"{prefix}{i}\",\"n\":{i}}}\n").as_bytes());
    }
    out
}

/// A zip archive holding `members`; names ending in `/` become directories.
pub async fn zip_bytes(members: &[(&str, &[u8])]) -> anyhow::Result<Vec<u8>> {
    let mut writer = ZipFileWriter::with_tokio(Vec::new());
    for (name, data) in members {
        let compression = if name.ends_with('/') {
            Compression::Stored
        } else {
            Compression::Deflate
        };
        let entry = ZipEntryBuilder::new(String::from(*name).into(), compression);
        writer.write_entry_whole(entry, data).await?;
    }
    Ok(writer.close().await?.into_inner())
}

pub async fn bzip2(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    async_compression::tokio::bufread::BzEncoder::new(data)
        .read_to_end(&mut out)
        .await?;
    Ok(out)
}

pub async fn gzip(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    async_compression::tokio::bufread::GzipEncoder::new(data)
        .read_to_end(&mut out)
        .await?;
    Ok(out)
}

/// A callback that records every body it is handed.
pub fn collector() -> (WalkCallback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cb = {
        let seen = seen.clone();
        callback(move |_ctx, body: Bytes| {
            seen.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&body).into_owned());
            async { Ok::<_, anyhow::Error>(()) }
        })
    };
    (cb, seen)
}
