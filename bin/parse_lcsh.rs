mod export_cli;

use ndjson_ingest::authority::AuthorityKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    export_cli::run(
        "parse-lcsh",
        "Write id,label CSV for Library of Congress subject headings (lcsh.both.ndjson)",
        AuthorityKind::Subjects,
    )
    .await
}
