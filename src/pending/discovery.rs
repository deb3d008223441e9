//! The discovery job resynchronizing a pending store with the primary store.
//!
//! The primary store is scanned in partitions (one per chromosome) on a
//! job-local rayon pool.  Each partition evaluates its records with the
//! descriptor and hands the outcome to its own sink; partitions share no
//! mutable state and their counters are merged by the pool's reduce step.
//! The target is prepared before and committed after all partitions ran.

use rayon::prelude::*;
use thousands::Separable;

use crate::primary::{Partition, PrimaryRecord, PrimaryStore, ScanOptions, StoreMetadata};
use crate::variant::Region;

use super::{Evaluation, PendingDescriptor};

/// Configuration of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq, derive_builder::Builder)]
#[builder(default)]
pub struct DiscoveryConfig {
    /// Restrict discovery to these regions, empty for the whole store.
    pub regions: Vec<Region>,
    /// Remove pending entries inside the scanned scope that the run did not reproduce.
    pub overwrite: bool,
    /// Number of worker threads, `None` for one per core.
    pub num_threads: Option<usize>,
    /// Number of records evaluated per chunk.
    pub batch_size: usize,
    /// Evaluate the records of each chunk in parallel.
    pub parallel_evaluation: bool,
    /// Number of table mutations per RocksDB write batch.
    pub write_batch_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            overwrite: false,
            num_threads: None,
            batch_size: 1_000,
            parallel_evaluation: false,
            write_batch_size: 10_000,
        }
    }
}

/// Aggregate counters of a discovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryCounters {
    /// Number of scanned primary store records.
    pub scanned: u64,
    /// Number of records that are ready or no longer pending.
    pub ready: u64,
    /// Number of records that became or stayed pending.
    pub pending: u64,
}

impl DiscoveryCounters {
    pub fn count(&mut self, evaluation: Evaluation) {
        self.scanned += 1;
        match evaluation {
            Evaluation::Ready | Evaluation::NoLongerPending => self.ready += 1,
            Evaluation::Pending => self.pending += 1,
        }
    }

    /// Aggregate other into self.
    pub fn aggregate(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.ready += other.ready;
        self.pending += other.pending;
    }
}

impl std::fmt::Display for DiscoveryCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned={} ready={} pending={}",
            self.scanned.separate_with_commas(),
            self.ready.separate_with_commas(),
            self.pending.separate_with_commas()
        )
    }
}

/// Receives the evaluated records of one partition.
pub trait DiscoverySink {
    fn apply(&mut self, record: &PrimaryRecord, evaluation: Evaluation)
        -> Result<(), anyhow::Error>;

    /// Called once after the partition was scanned completely.
    fn finish(&mut self) -> Result<(), anyhow::Error>;
}

/// Backing store side of a discovery run.
pub trait DiscoveryTarget: Sync {
    /// Create or verify the store before any partition runs.
    fn prepare(&self, config: &DiscoveryConfig) -> Result<(), anyhow::Error>;

    /// Sink for the partition with the given index.
    fn sink<'a>(
        &'a self,
        index: usize,
        partition: &Partition,
    ) -> Result<Box<dyn DiscoverySink + 'a>, anyhow::Error>;

    /// Single-threaded post-phase after all partitions finished.
    fn commit(&self, config: &DiscoveryConfig) -> Result<(), anyhow::Error>;
}

/// Run discovery of `descriptor` over `primary` into `target`.
pub fn run<D, T>(
    primary: &PrimaryStore,
    descriptor: &D,
    target: &T,
    config: &DiscoveryConfig,
) -> Result<DiscoveryCounters, anyhow::Error>
where
    D: PendingDescriptor + ?Sized,
    T: DiscoveryTarget + ?Sized,
{
    let before_anything = std::time::Instant::now();
    target.prepare(config)?;

    let metadata = primary.metadata()?;
    let mut scan = ScanOptions::default();
    descriptor.configure_scan(&mut scan, &metadata);

    let partitions = primary.partitions(&config.regions)?;
    tracing::info!(
        "discovering pending variants for {:?} in {} partition(s)",
        descriptor.name(),
        partitions.len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.num_threads.unwrap_or(0))
        .build()
        .map_err(|e| anyhow::anyhow!("building discovery thread pool failed: {}", e))?;
    let counters = pool.install(|| {
        partitions
            .par_iter()
            .enumerate()
            .map(|(index, partition)| {
                run_partition(
                    primary, descriptor, target, &metadata, &scan, config, index, partition,
                )
                .map_err(|e| {
                    anyhow::anyhow!("discovery in partition {} failed: {}", &partition.chrom, e)
                })
            })
            .try_reduce(DiscoveryCounters::default, |mut lhs, rhs| {
                lhs.aggregate(rhs);
                Ok(lhs)
            })
    })?;

    target.commit(config)?;

    tracing::info!(
        "discovery of {:?} done in {:?}: {}",
        descriptor.name(),
        before_anything.elapsed(),
        &counters
    );
    Ok(counters)
}

#[allow(clippy::too_many_arguments)]
fn run_partition<D, T>(
    primary: &PrimaryStore,
    descriptor: &D,
    target: &T,
    metadata: &StoreMetadata,
    scan: &ScanOptions,
    config: &DiscoveryConfig,
    index: usize,
    partition: &Partition,
) -> Result<DiscoveryCounters, anyhow::Error>
where
    D: PendingDescriptor + ?Sized,
    T: DiscoveryTarget + ?Sized,
{
    let mut sink = target.sink(index, partition)?;
    let mut counters = DiscoveryCounters::default();

    primary.scan_partition(partition, scan, config.batch_size, |chunk| {
        let evaluations: Vec<Evaluation> = if config.parallel_evaluation {
            chunk
                .par_iter()
                .map(|record| descriptor.evaluate(record, metadata))
                .collect()
        } else {
            chunk
                .iter()
                .map(|record| descriptor.evaluate(record, metadata))
                .collect()
        };
        for (record, evaluation) in chunk.iter().zip(evaluations) {
            counters.count(evaluation);
            sink.apply(record, evaluation)?;
        }
        Ok(())
    })?;
    sink.finish()?;

    tracing::debug!("partition {} ({}): {}", index, &partition.chrom, &counters);
    Ok(counters)
}
