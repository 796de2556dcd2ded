use clap::{Arg, Command};
use ndjson_ingest::authority::AuthorityKind;
use serde_json::json;
use std::io::{self, Write};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write synthetic authority NDJSON to stdout")
        .arg(
            Arg::new("records")
                .long("records")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(Arg::new("kind").long("kind").default_value("lcsh"))
        .arg(
            Arg::new("dupe_every")
                .long("dupe-every")
                .help("Every Nth record reuses the previous record's id (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .get_matches();

    let records = matches.get_one::<u64>("records").copied().unwrap_or(0);
    let kind: AuthorityKind = matches
        .get_one::<String>("kind")
        .map(String::as_str)
        .unwrap_or("lcsh")
        .parse()?;
    let dupe_every = matches.get_one::<u64>("dupe_every").copied().unwrap_or(0);
    let id_prefix = kind.id_prefix();
    let id_stem = match kind {
        AuthorityKind::Subjects => "sh",
        AuthorityKind::Names => "n",
    };

    let mut out = io::BufWriter::new(io::stdout().lock());

    for i in 0..records {
        let n = if dupe_every > 0 && i > 0 && i % dupe_every == 0 {
            i - 1
        } else {
            i
        };
        let id = format!("{id_prefix}{id_stem}{n:010}");
        let record = json!({
            "@context": "http://v3/authorities/context.json",
            "@graph": [
                {
                    "@id": id,
                    "@type": ["madsrdf:Authority", "skos:Concept"],
                    "madsrdf:authoritativeLabel": {"@language": "en", "@value": format!("Heading {n}")},
                },
                {
                    "@id": format!("_:b{i}"),
                    "madsrdf:authoritativeLabel": "blank node",
                },
            ],
        });
        serde_json::to_writer(&mut out, &record)?;
        writeln!(&mut out)?;
        if i % 10_000 == 0 {
            out.flush()?;
        }
    }

    out.flush()?;
    Ok(())
}
