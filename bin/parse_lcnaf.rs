mod export_cli;

use ndjson_ingest::authority::AuthorityKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    export_cli::run(
        "parse-lcnaf",
        "Write id,label CSV for Library of Congress name authorities (lcnaf.both.ndjson[.zip])",
        AuthorityKind::Names,
    )
    .await
}
