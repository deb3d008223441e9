//! Implementation of the pending store subcommands.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use thousands::Separable;

use crate::common::{self, io::open_write_maybe_gz};
use crate::fs::LocalFileSystem;
use crate::primary::PrimaryStore;

use super::descriptor::{
    AnnotationPendingDescriptor, WindowedAnnotationPendingDescriptor, DEFAULT_WINDOW_SIZE,
};
use super::file::FilePendingVariantsManager;
use super::table::TablePendingVariantsManager;
use super::{
    DiscoveryConfig, DiscoveryConfigBuilder, DiscoveryCounters, PendingCleaner, PendingQuery,
    PendingReader, PendingVariantsManager, DEFAULT_BATCH_SIZE,
};

/// Backing store of the pending variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    /// Column family in the primary store database.
    #[default]
    Table,
    /// Directory of windowed shard files.
    File,
}

/// Arguments selecting the pending store, shared by all subcommands.
#[derive(Debug, Clone, clap::Args)]
pub struct StoreArgs {
    /// Path to the primary store RocksDB.
    #[clap(long)]
    pub path_db: String,
    /// Backing store of the pending variants.
    #[clap(long, value_enum, default_value_t = Backend::Table)]
    pub backend: Backend,
    /// Directory of the shard files, required with `--backend file`.
    #[clap(long)]
    pub path_pending: Option<String>,
    /// Name of the column family, defaults to the descriptor's table name.
    #[clap(long)]
    pub table: Option<String>,
    /// Number of positions per shard file.
    #[clap(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: u32,
}

impl StoreArgs {
    /// Manager for the selected backend on `primary`.
    pub fn manager(
        &self,
        primary: &PrimaryStore,
    ) -> Result<Box<dyn PendingVariantsManager>, anyhow::Error> {
        match self.backend {
            Backend::Table => Ok(Box::new(TablePendingVariantsManager::new(
                primary,
                Arc::new(AnnotationPendingDescriptor),
                self.table.clone(),
            )?)),
            Backend::File => {
                let path_pending = self.path_pending.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("--path-pending is required with --backend {}", self.backend)
                })?;
                Ok(Box::new(FilePendingVariantsManager::new(
                    Arc::new(LocalFileSystem),
                    PathBuf::from(path_pending),
                    Arc::new(WindowedAnnotationPendingDescriptor::new(self.window_size)?),
                )))
            }
        }
    }
}

/// Command line arguments for `discover` subcommand.
#[derive(Debug, Clone, clap::Parser)]
#[command(about = "discover pending variants in the primary store", long_about = None)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Restrict discovery to regions, e.g., `1`, `1:1000`, or `1:1,000-2,000`.
    #[clap(long = "region")]
    pub regions: Vec<String>,
    /// Remove pending entries in the scanned scope that are not reproduced.
    #[clap(long)]
    pub overwrite: bool,
    /// Number of worker threads, defaults to one per core.
    #[clap(long)]
    pub num_threads: Option<usize>,
    /// Number of records evaluated per chunk.
    #[clap(long, default_value_t = 1_000)]
    pub batch_size: usize,
    /// Evaluate the records of each chunk in parallel.
    #[clap(long)]
    pub parallel_evaluation: bool,
    /// Number of table mutations per write batch.
    #[clap(long, default_value_t = 10_000)]
    pub write_batch_size: usize,
}

impl DiscoverArgs {
    fn config(&self) -> Result<DiscoveryConfig, anyhow::Error> {
        let query = PendingQuery::from_region_strs(&self.regions)?;
        Ok(DiscoveryConfigBuilder::default()
            .regions(query.regions)
            .overwrite(self.overwrite)
            .num_threads(self.num_threads)
            .batch_size(self.batch_size)
            .parallel_evaluation(self.parallel_evaluation)
            .write_batch_size(self.write_batch_size)
            .build()?)
    }
}

/// Command line arguments for `list` subcommand.
#[derive(Debug, Clone, clap::Parser)]
#[command(about = "write pending variants as JSON lines", long_about = None)]
pub struct ListArgs {
    #[command(flatten)]
    pub store: StoreArgs,
    /// Restrict to regions, e.g., `1`, `1:1000`, or `1:1,000-2,000`.
    #[clap(long = "region")]
    pub regions: Vec<String>,
    /// Number of variants per read.
    #[clap(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// Remove the written variants from the pending store.
    #[clap(long)]
    pub mark_processed: bool,
    /// Output file, stdout if not given; gzip compressed with `.gz` suffix.
    #[clap(long)]
    pub path_out: Option<String>,
}

/// Command line arguments for `check` subcommand.
#[derive(Debug, Clone, clap::Parser)]
#[command(about = "read the whole pending store once", long_about = None)]
pub struct CheckArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

/// Command line arguments for `delete` subcommand.
#[derive(Debug, Clone, clap::Parser)]
#[command(about = "remove the pending store", long_about = None)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

/// Run discovery for `args` on `primary`.
pub fn discover(
    primary: &PrimaryStore,
    args: &DiscoverArgs,
) -> Result<DiscoveryCounters, anyhow::Error> {
    let manager = args.store.manager(primary)?;
    manager.discover_pending(primary, &args.config()?)
}

/// Main entry point for `discover` sub command.
pub fn run_discover(args_common: &common::Args, args: &DiscoverArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let primary = PrimaryStore::open(&args.store.path_db)?;
    let counters = discover(&primary, args)?;
    tracing::info!(
        "scanned {} records, {} ready, {} pending",
        counters.scanned.separate_with_commas(),
        counters.ready.separate_with_commas(),
        counters.pending.separate_with_commas()
    );

    Ok(())
}

/// Write the variants of `reader` to `out`, handing each batch to `cleaner`.
fn drain<'a>(
    reader: &mut Box<dyn PendingReader + 'a>,
    cleaner: &mut Option<Box<dyn PendingCleaner + 'a>>,
    batch_size: usize,
    out: &mut dyn Write,
) -> Result<usize, anyhow::Error> {
    reader.open()?;
    reader.pre()?;
    let mut count = 0;
    loop {
        let batch = reader.read(batch_size)?;
        if batch.is_empty() {
            break;
        }
        for variant in &batch {
            serde_json::to_writer(&mut *out, variant)?;
            out.write_all(b"\n")?;
        }
        if let Some(cleaner) = cleaner.as_mut() {
            out.flush()?;
            cleaner.write(&batch)?;
        }
        count += batch.len();
    }
    reader.post()?;
    Ok(count)
}

/// Write the pending variants matching `query` to `out` as JSON lines.
///
/// With `mark_processed`, written variants are handed to the store's cleaner
/// and committed after the last batch, or aborted on failure.
pub fn list(
    manager: &dyn PendingVariantsManager,
    query: &PendingQuery,
    batch_size: usize,
    mark_processed: bool,
    out: &mut dyn Write,
) -> Result<usize, anyhow::Error> {
    let mut cleaner = if mark_processed {
        let mut cleaner = manager.cleaner()?;
        cleaner.pre()?;
        Some(cleaner)
    } else {
        None
    };

    let mut reader = manager.reader(query)?;
    let result = drain(&mut reader, &mut cleaner, batch_size, out);
    let closed = reader.close();

    if let Some(mut cleaner) = cleaner {
        match (&result, &closed) {
            (Ok(_), Ok(())) => cleaner.success()?,
            _ => cleaner.abort()?,
        }
        cleaner.close()?;
    }

    let count = result?;
    closed?;
    out.flush()?;
    Ok(count)
}

/// Main entry point for `list` sub command.
pub fn run_list(args_common: &common::Args, args: &ListArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let primary = PrimaryStore::open(&args.store.path_db)?;
    let manager = args.store.manager(&primary)?;
    let query = PendingQuery::from_region_strs(&args.regions)?;
    let mut out: Box<dyn Write> = match &args.path_out {
        Some(path_out) => open_write_maybe_gz(path_out)?,
        None => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
    };
    let count = list(
        manager.as_ref(),
        &query,
        args.batch_size,
        args.mark_processed,
        &mut out,
    )?;
    tracing::info!("wrote {} pending variants", count.separate_with_commas());

    Ok(())
}

/// Main entry point for `check` sub command.
pub fn run_check(args_common: &common::Args, args: &CheckArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let primary = PrimaryStore::open(&args.store.path_db)?;
    let manager = args.store.manager(&primary)?;
    if !manager.exists()? {
        tracing::warn!("pending store of {:?} does not exist", manager.descriptor_name());
    }
    manager.check_integrity()
}

/// Main entry point for `delete` sub command.
pub fn run_delete(args_common: &common::Args, args: &DeleteArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    let primary = PrimaryStore::open(&args.store.path_db)?;
    let manager = args.store.manager(&primary)?;
    manager.delete()
}
