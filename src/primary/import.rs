//! Implementation of the `import` subcommand.

use std::io::BufRead;

use thousands::Separable;

use crate::common::{self, io::open_read_maybe_gz};
use crate::variant::Variant;

use super::{PrimaryStore, StoredRecord};

/// Command line arguments for `import` subcommand.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "import variant records into the primary store", long_about = None)]
pub struct Args {
    /// Path to the primary store RocksDB.
    #[clap(long)]
    pub path_db: String,
    /// Path(s) to JSON lines input file(s), optionally gzip compressed.
    #[clap(long, required = true)]
    pub path_in: Vec<String>,
    /// Identifier of the current annotation run to record in the metadata.
    #[clap(long)]
    pub annotation_id: Option<String>,
}

/// One input line: a variant with its stored record.
#[derive(Debug, Clone, serde::Deserialize)]
struct InputRecord {
    chromosome: String,
    position: u32,
    reference: String,
    alternative: String,
    #[serde(flatten)]
    stored: StoredRecord,
}

/// Import all records from the JSON lines file at `path`.
fn import_file(store: &PrimaryStore, path: &str) -> Result<usize, anyhow::Error> {
    let reader = open_read_maybe_gz(path)?;
    let mut count = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| anyhow::anyhow!("problem reading {}: {}", path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: InputRecord = serde_json::from_str(&line).map_err(|e| {
            anyhow::anyhow!("problem parsing {}:{}: {}", path, lineno + 1, e)
        })?;
        let variant = Variant::new(
            &record.chromosome,
            record.position,
            &record.reference,
            &record.alternative,
        );
        store.put(&variant, &record.stored)?;
        count += 1;
    }
    Ok(count)
}

/// Main entry point for `import` sub command.
pub fn run(args_common: &common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = std::time::Instant::now();
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let store = PrimaryStore::open(&args.path_db)?;
    store.put_meta("db-name", "pending-variants-primary")?;
    store.put_meta("pending-variants-version", common::worker_version())?;
    if let Some(annotation_id) = &args.annotation_id {
        store.set_annotation_id(annotation_id)?;
    }

    let mut total = 0;
    for path in &args.path_in {
        tracing::info!("importing {} ...", path);
        let count = import_file(&store, path)?;
        tracing::info!("... imported {} records", count.separate_with_commas());
        total += count;
    }

    tracing::info!(
        "All of `import` completed in {:?}, {} records in total",
        before_anything.elapsed(),
        total.separate_with_commas()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use crate::primary::{PrimaryStore, Partition, ScanOptions};

    #[test]
    fn run_imports_records() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path_in = tmp_dir.join("in.jsonl.gz");
        {
            let mut f = crate::common::io::open_write_maybe_gz(&path_in)?;
            writeln!(
                f,
                r#"{{"chromosome":"1","position":10,"reference":"A","alternative":"G","annotation_id":"v1"}}"#
            )?;
            writeln!(f)?;
            writeln!(
                f,
                r#"{{"chromosome":"2","position":20,"reference":"C","alternative":"T"}}"#
            )?;
        }

        let args = super::Args {
            path_db: tmp_dir.join("db").to_string_lossy().to_string(),
            path_in: vec![path_in.to_string_lossy().to_string()],
            annotation_id: Some("v1".into()),
        };
        super::run(&Default::default(), &args)?;

        let store = PrimaryStore::open(&args.path_db)?;
        assert_eq!(store.metadata()?.annotation_id.as_deref(), Some("v1"));
        assert_eq!(store.chromosomes()?, vec!["1", "2"]);

        let mut stored = Vec::new();
        store.scan_partition(
            &Partition::whole_chromosome("1"),
            &ScanOptions::default(),
            10,
            |chunk| {
                stored.extend(chunk.iter().map(|r| r.stored()).collect::<Result<Vec<_>, _>>()?);
                Ok(())
            },
        )?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].annotation_id.as_deref(), Some("v1"));

        Ok(())
    }

    #[test]
    fn run_fails_on_bad_line() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path_in = tmp_dir.join("in.jsonl");
        std::fs::write(&path_in, "{\"chromosome\": 1}\n")?;

        let args = super::Args {
            path_db: tmp_dir.join("db").to_string_lossy().to_string(),
            path_in: vec![path_in.to_string_lossy().to_string()],
            annotation_id: None,
        };
        let err = super::run(&Default::default(), &args).unwrap_err();
        assert!(err.to_string().contains("in.jsonl:1"));

        Ok(())
    }
}
