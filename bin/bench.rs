use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use ndjson_ingest::{callback, new_walker};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    let matches = Command::new("bench")
        .arg(Arg::new("uri").long("uri").required(true).help("File or URL to walk"))
        .arg(
            Arg::new("walker")
                .long("walker")
                .default_value("ndjson://")
                .help("Walker URI, e.g. ndjson://?workers=50&validate=true"),
        )
        .arg(
            Arg::new("verify")
                .long("verify")
                .help("XOR of per-record CRC32s (independent of dispatch order)")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let uri = matches
        .get_one::<String>("uri")
        .cloned()
        .context("--uri is required")?;
    let walker_uri = matches
        .get_one::<String>("walker")
        .map(String::as_str)
        .unwrap_or("ndjson://");
    let verify = matches.get_flag("verify");

    let walker = new_walker(walker_uri)?;
    let records = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    let digest = Arc::new(AtomicU32::new(0));

    let cb = {
        let records = records.clone();
        let bytes = bytes.clone();
        let digest = digest.clone();
        callback(move |_ctx, body| {
            records.fetch_add(1, Ordering::Relaxed);
            bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
            if verify {
                digest.fetch_xor(crc32fast::hash(&body), Ordering::Relaxed);
            }
            async { Ok::<_, anyhow::Error>(()) }
        })
    };

    let start = Instant::now();
    walker
        .walk_uris(&CancellationToken::new(), &cb, &[uri.clone()])
        .await?;
    let elapsed = start.elapsed().as_secs_f64();

    let records = records.load(Ordering::Relaxed);
    let mib = bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0);
    let rps = records as f64 / elapsed;
    if verify {
        println!(
            "source={} records={} crc=0x{:08x}\nelapsed={:.1}s records/sec={:.0} MiB/sec={:.1}",
            uri,
            records,
            digest.load(Ordering::Relaxed),
            elapsed,
            rps,
            mib / elapsed
        );
    } else {
        println!(
            "source={} records={}\nelapsed={:.1}s records/sec={:.0} MiB/sec={:.1}",
            uri,
            records,
            elapsed,
            rps,
            mib / elapsed
        );
    }
    Ok(())
}
