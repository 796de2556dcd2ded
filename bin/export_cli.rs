use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use ndjson_ingest::authority::{export, AuthorityKind, ExportConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Logs go to stderr; stdout carries the CSV.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(name: &'static str, about: &'static str, kind: AuthorityKind) -> anyhow::Result<()> {
    init_tracing();

    let matches = Command::new(name)
        .about(about)
        .arg(
            Arg::new("uris")
                .help("Dump files or URLs (.ndjson, .ndjson.zip, .bz2, .gz, .zst)")
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .help("Maximum concurrent record handlers")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("100"),
        )
        .arg(
            Arg::new("catalog")
                .long("catalog")
                .help("Dedup catalog: tmp://, sqlite:// or memory://")
                .default_value(kind.default_catalog()),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .help("Reject lines that are not valid JSON")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let uris: Vec<String> = matches
        .get_many::<String>("uris")
        .into_iter()
        .flatten()
        .cloned()
        .collect();
    let workers = matches.get_one::<u64>("workers").copied().unwrap_or(100);
    let validate = matches.get_flag("validate");

    let mut config = ExportConfig::new(kind);
    config.walker_uri = format!("ndjson://?workers={workers}&validate={validate}");
    if let Some(catalog) = matches.get_one::<String>("catalog") {
        config.catalog_uri = catalog.clone();
    }

    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping after in-flight records");
                ctx.cancel();
            }
        }
    });

    export(&ctx, &config, &uris, tokio::io::stdout())
        .await
        .with_context(|| format!("failed to export {kind} records"))?;
    Ok(())
}
