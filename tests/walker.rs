mod common;

use common::{bzip2, collector, gzip, ndjson, zip_bytes};
use futures::StreamExt;
use ndjson_ingest::{
    callback, open_uri, IngestError, LocalBucket, NdjsonWalker, RecordReader, WalkOptions, Walker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn walker(workers: usize) -> NdjsonWalker {
    NdjsonWalker::new(WalkOptions {
        workers,
        ..WalkOptions::default()
    })
}

fn path_string(path: &std::path::Path) -> String {
    path.display().to_string()
}

#[tokio::test]
async fn reader_numbers_every_line() -> anyhow::Result<()> {
    let data = b"{\"a\":1}\n\n{\"a\":3}\r\n{\"a\":4}\n".to_vec();
    let records: Vec<_> = RecordReader::new(&data[..], WalkOptions::default().for_path("mem"))
        .into_stream()
        .collect()
        .await;

    let records = records.into_iter().collect::<Result<Vec<_>, _>>()?;
    let lines: Vec<u64> = records.iter().map(|r| r.line).collect();
    assert_eq!(lines, vec![1, 2, 3, 4]);
    assert_eq!(&records[0].body[..], b"{\"a\":1}");
    assert!(records[1].body.is_empty());
    assert_eq!(&records[2].body[..], b"{\"a\":3}");
    assert!(records.iter().all(|r| r.path == "mem"));
    Ok(())
}

#[tokio::test]
async fn reader_drops_unterminated_final_line() -> anyhow::Result<()> {
    let data = b"{\"a\":1}\n{\"a\":2}\n{\"a\":".to_vec();
    let mut reader = RecordReader::new(&data[..], WalkOptions::default());
    let mut bodies = Vec::new();
    while let Some(record) = reader.next().await {
        bodies.push(record?.body);
    }
    assert_eq!(bodies.len(), 2);
    assert_eq!(reader.lines_read(), 2);
    Ok(())
}

#[tokio::test]
async fn validation_reports_the_bad_line() -> anyhow::Result<()> {
    let data = b"{\"a\":1}\n{\"a\": oops}\n{\"a\" : 3}\n".to_vec();

    let options = WalkOptions {
        validate_json: true,
        ..WalkOptions::default()
    }
    .for_path("dump.ndjson");
    let mut reader = RecordReader::new(&data[..], options);

    let first = reader.next().await.expect("first record")?;
    assert_eq!(first.line, 1);
    let err = reader.next().await.expect("second record").unwrap_err();
    assert_eq!(err.line, 2);
    assert_eq!(err.path, "dump.ndjson");
    assert!(matches!(err.source, IngestError::Json(_)));
    // Validation re-serializes compactly.
    let third = reader.next().await.expect("third record")?;
    assert_eq!(&third.body[..], b"{\"a\":3}");

    // Without validation the same line is forwarded verbatim.
    let records: Vec<_> = RecordReader::new(&data[..], WalkOptions::default())
        .into_stream()
        .collect()
        .await;
    let bodies = records
        .into_iter()
        .map(|r| r.map(|r| r.body))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(&bodies[1][..], b"{\"a\": oops}");
    assert_eq!(&bodies[2][..], b"{\"a\" : 3}");
    Ok(())
}

#[tokio::test]
async fn filter_and_format_shape_records() -> anyhow::Result<()> {
    let data = ndjson("sh", 4);
    let options = WalkOptions {
        format_json: true,
        filter: Some(Arc::new(|body: &[u8]| {
            memchr::memmem::find(body, b"\"n\":2").is_none()
        })),
        ..WalkOptions::default()
    };
    let mut reader = RecordReader::new(&data[..], options);

    let mut lines = Vec::new();
    while let Some(record) = reader.next().await {
        let record = record?;
        assert!(record.body.contains(&b'\n'), "pretty-printed");
        lines.push(record.line);
    }
    assert_eq!(lines, vec![1, 3, 4]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn walks_every_line_of_a_plain_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lcsh.ndjson");
    let data = ndjson("sh", 1_000);
    tokio::fs::write(&path, &data).await?;

    let (_, size) = open_uri(&path_string(&path)).await?;
    assert_eq!(size, data.len() as u64);

    let (cb, seen) = collector();
    walker(8)
        .walk_uris(&CancellationToken::new(), &cb, &[path_string(&path)])
        .await?;

    let mut seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1_000);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 1_000);
    Ok(())
}

#[tokio::test]
async fn walks_compressed_files_by_suffix() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let bz = dir.path().join("names.ndjson.bz2");
    let gz = dir.path().join("names.ndjson.gz");
    tokio::fs::write(&bz, bzip2(&ndjson("n", 10)).await?).await?;
    tokio::fs::write(&gz, gzip(&ndjson("g", 5)).await?).await?;

    let (cb, seen) = collector();
    walker(4)
        .walk_uris(
            &CancellationToken::new(),
            &cb,
            &[path_string(&bz), path_string(&gz)],
        )
        .await?;

    assert_eq!(seen.lock().unwrap().len(), 15);
    Ok(())
}

#[tokio::test]
async fn walks_every_zip_member() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lcnaf.both.ndjson.zip");
    let part1 = ndjson("a", 3);
    let part2 = gzip(&ndjson("b", 2)).await?;
    let archive = zip_bytes(&[
        ("part-1.ndjson", part1.as_slice()),
        ("nested/", &[][..]),
        ("nested/part-2.ndjson.gz", part2.as_slice()),
    ])
    .await?;
    tokio::fs::write(&path, archive).await?;

    let (cb, seen) = collector();
    walker(4)
        .walk_uris(&CancellationToken::new(), &cb, &[path_string(&path)])
        .await?;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen.len(), 5);
    assert!(seen[0].contains("\"a1\""));
    assert!(seen[4].contains("\"b2\""));
    Ok(())
}

#[tokio::test]
async fn callback_error_stops_the_walk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first.ndjson");
    let second = dir.path().join("second.ndjson");
    tokio::fs::write(&first, ndjson("x", 20)).await?;
    tokio::fs::write(&second, ndjson("y", 20)).await?;

    let second_calls = Arc::new(AtomicUsize::new(0));
    let cb = {
        let second_calls = second_calls.clone();
        callback(move |_ctx, body| {
            let text = String::from_utf8_lossy(&body).into_owned();
            let second_calls = second_calls.clone();
            async move {
                if text.contains("\"y") {
                    second_calls.fetch_add(1, Ordering::SeqCst);
                }
                if text.contains("\"x3\"") {
                    anyhow::bail!("cannot index {text}");
                }
                Ok(())
            }
        })
    };

    let err = walker(1)
        .walk_uris(
            &CancellationToken::new(),
            &cb,
            &[path_string(&first), path_string(&second)],
        )
        .await
        .unwrap_err();

    match err {
        IngestError::Walk(e) => {
            assert_eq!(e.path, path_string(&first));
            assert_eq!(e.line, 3);
            assert!(matches!(e.source, IngestError::Callback(_)));
            assert!(e.to_string().contains("cannot index"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn validation_error_aborts_with_line_number() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.ndjson");
    let mut data = ndjson("sh", 3);
    data.extend_from_slice(b"{not json}\n");
    data.extend_from_slice(&ndjson("tail", 3));
    tokio::fs::write(&path, data).await?;

    let (cb, seen) = collector();
    let walker = walker(2);
    let walker = NdjsonWalker::new(WalkOptions {
        validate_json: true,
        ..walker.options().clone()
    });
    let err = walker
        .walk_file(&CancellationToken::new(), &cb, &path_string(&path))
        .await
        .unwrap_err();

    let IngestError::Walk(e) = err else {
        panic!("expected a walk error, got {err}");
    };
    assert_eq!(e.line, 4);
    assert!(!seen.lock().unwrap().iter().any(|b| b.contains("not json")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_dispatch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first.ndjson");
    let second = dir.path().join("second.ndjson");
    tokio::fs::write(&first, ndjson("x", 1_000)).await?;
    tokio::fs::write(&second, ndjson("y", 10)).await?;

    let ctx = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let cb = {
        let ctx = ctx.clone();
        let calls = calls.clone();
        callback(move |_task_ctx, _body| {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.cancel();
            async { Ok::<_, anyhow::Error>(()) }
        })
    };

    tokio::time::timeout(
        Duration::from_secs(5),
        walker(1).walk_uris(&ctx, &cb, &[path_string(&first), path_string(&second)]),
    )
    .await??;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn walks_an_open_reader() -> anyhow::Result<()> {
    let data = ndjson("r", 7);
    let (cb, seen) = collector();
    walker(3)
        .walk_reader(&CancellationToken::new(), &cb, Box::new(&data[..]), "stdin")
        .await?;
    assert_eq!(seen.lock().unwrap().len(), 7);
    Ok(())
}

#[tokio::test]
async fn missing_file_is_a_source_error() {
    let (cb, _) = collector();
    let err = walker(1)
        .walk_uris(
            &CancellationToken::new(),
            &cb,
            &["/definitely/not/here.ndjson".to_string()],
        )
        .await
        .unwrap_err();
    let IngestError::Walk(e) = err else {
        panic!("expected a walk error, got {err}");
    };
    assert_eq!(e.line, 0);
    assert!(matches!(e.source, IngestError::Open { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn walks_a_bucket_prefix() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tokio::fs::create_dir_all(dir.path().join("2024/01")).await?;
    tokio::fs::write(dir.path().join("2024/a.ndjson"), ndjson("a", 2)).await?;
    tokio::fs::write(dir.path().join("2024/01/b.ndjson"), ndjson("b", 3)).await?;
    tokio::fs::write(dir.path().join("2024/01/c.ndjson.gz"), gzip(&ndjson("c", 4)).await?).await?;
    tokio::fs::write(dir.path().join("2024/empty.ndjson"), b"").await?;
    tokio::fs::write(dir.path().join("2024/README.txt"), b"not ndjson\n").await?;
    tokio::fs::write(dir.path().join("other.ndjson"), ndjson("o", 9)).await?;

    let bucket = Arc::new(LocalBucket::new(dir.path()));
    let (cb, seen) = collector();
    walker(2)
        .walk_bucket(
            &CancellationToken::new(),
            &cb,
            bucket,
            "2024/",
            Some(Arc::new(|key: &str| !key.ends_with(".txt"))),
        )
        .await?;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 9);
    assert!(!seen.iter().any(|b| b.contains("\"o")));
    Ok(())
}

#[tokio::test]
async fn bucket_walk_fails_fast() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    tokio::fs::write(dir.path().join("a.ndjson"), ndjson("a", 5)).await?;
    tokio::fs::write(dir.path().join("b.ndjson"), ndjson("b", 5)).await?;

    let cb = callback(|_ctx, body| async move {
        if body.starts_with(b"{\"id\":\"b2\"") {
            anyhow::bail!("rejected");
        }
        Ok(())
    });

    let err = walker(1)
        .walk_bucket(
            &CancellationToken::new(),
            &cb,
            Arc::new(LocalBucket::new(dir.path())),
            "",
            None,
        )
        .await
        .unwrap_err();
    let IngestError::Walk(e) = err else {
        panic!("expected a walk error, got {err}");
    };
    assert_eq!(e.path, "b.ndjson");
    assert_eq!(e.line, 2);
    Ok(())
}

#[tokio::test]
async fn truncated_compressed_file_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("a.ndjson.gz");
    let compressed = gzip(&ndjson("a", 5_000)).await?;
    tokio::fs::write(&path, &compressed[..compressed.len() / 2]).await?;

    let (cb, seen) = collector();
    let err = walker(4)
        .walk_uris(&CancellationToken::new(), &cb, &[path_string(&path)])
        .await
        .unwrap_err();

    let IngestError::Walk(e) = err else {
        panic!("expected a walk error, got {err}");
    };
    assert!(!e.is_end_of_stream());
    assert!(matches!(
        e.source,
        IngestError::ShortRead(_) | IngestError::Io(_)
    ));
    assert_eq!(e.path, path_string(&path));
    let dispatched = seen.lock().unwrap().len() as u64;
    assert!(dispatched < 5_000);
    assert!(e.line > dispatched);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_worker_limit() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lcsh.ndjson");
    tokio::fs::write(&path, ndjson("sh", 40)).await?;

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let cb = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        let calls = calls.clone();
        callback(move |_ctx, _body| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let calls = calls.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    };

    walker(3)
        .walk_uris(&CancellationToken::new(), &cb, &[path_string(&path)])
        .await?;

    assert_eq!(calls.load(Ordering::SeqCst), 40);
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {peak}");
    Ok(())
}
