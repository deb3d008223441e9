//! Pending store kept as a directory of windowed shard files.
//!
//! Each shard file `NAME.CHROM.POS10.json.gz` holds the pending variants of one
//! position window.  Discovery writes shards below a run-specific scratch
//! directory and moves them into the pending directory once all partitions
//! finished.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::err::PendingError;
use crate::fs::{FileStatus, FileSystem};
use crate::primary::{Partition, PrimaryRecord, PrimaryStore};
use crate::variant::Region;

use super::descriptor::{window_start, SHARD_SUFFIX};
use super::discovery::{self, DiscoverySink, DiscoveryTarget};
use super::{
    DiscoveryConfig, DiscoveryCounters, Evaluation, FilePendingDescriptor, PendingCleaner,
    PendingQuery, PendingReader, PendingVariantsManager,
};

pub mod cleaner;
pub mod reader;
pub mod shard;

pub use cleaner::FilePendingCleaner;
pub use reader::FilePendingReader;

/// Name of the directory below the pending directory holding scratch runs.
pub const SCRATCH_DIR: &str = "scratch";

/// One shard file found in the pending directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShardEntry {
    pub path: PathBuf,
    pub chrom: String,
    pub window_start: u32,
}

/// Outcome of moving scratch output into the pending directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveSummary {
    /// Shard files moved into place.
    pub moved: usize,
    /// Existing shard files replaced by a moved one.
    pub replaced: usize,
    /// Shard files in scope that the run did not reproduce.
    pub removed: usize,
}

/// `PendingVariantsManager` on a directory of shard files.
pub struct FilePendingVariantsManager {
    pub(crate) fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    descriptor: Arc<dyn FilePendingDescriptor>,
}

impl std::fmt::Debug for FilePendingVariantsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePendingVariantsManager")
            .field("fs", &self.fs)
            .field("dir", &self.dir)
            .field("descriptor", &self.descriptor.name())
            .field("window_size", &self.descriptor.window_size())
            .finish()
    }
}

impl FilePendingVariantsManager {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        dir: PathBuf,
        descriptor: Arc<dyn FilePendingDescriptor>,
    ) -> Self {
        Self {
            fs,
            dir,
            descriptor,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the shard file holding the variants at `chrom:pos`.
    pub fn shard_path(&self, chrom: &str, pos: u32) -> PathBuf {
        self.dir.join(self.descriptor.shard_name(chrom, pos))
    }

    /// Shard files of this descriptor, sorted by path; empty for a missing directory.
    pub fn list_shards(&self) -> Result<Vec<ShardEntry>, anyhow::Error> {
        if !self.fs.exists(&self.dir)? {
            return Ok(Vec::new());
        }
        let mut result = self
            .fs
            .list(&self.dir)?
            .into_iter()
            .filter(|status| !status.is_dir)
            .filter_map(|status| {
                self.descriptor
                    .parse_shard_name(status.file_name())
                    .map(|(chrom, window_start)| ShardEntry {
                        path: status.path.clone(),
                        chrom,
                        window_start,
                    })
            })
            .collect::<Vec<_>>();
        result.sort();
        Ok(result)
    }

    /// Fail if the directory holds shard files of another descriptor.
    fn verify_ownership(&self) -> Result<(), anyhow::Error> {
        for status in self.fs.list(&self.dir)? {
            let name = status.file_name();
            if !status.is_dir && name.ends_with(SHARD_SUFFIX) && !self.descriptor.is_shard_file(name)
            {
                return Err(PendingError::DescriptorMismatch {
                    descriptor: self.descriptor.name().to_string(),
                    store: status.path.to_string_lossy().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fresh, run-unique scratch directory below the pending directory.
    fn new_scratch_dir(&self) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let suffix = std::iter::repeat_with(fastrand::alphanumeric)
            .take(5)
            .collect::<String>();
        self.dir
            .join(SCRATCH_DIR)
            .join(format!("{}-{}", timestamp, suffix))
    }

    /// Widen `region` to the whole windows it touches.
    ///
    /// Each moved shard replaces its canonical file, so every window touched by
    /// a discovery run must be scanned completely.
    pub fn window_aligned(&self, region: &Region) -> Region {
        let window_size = self.descriptor.window_size();
        Region::new(
            &region.chrom,
            window_start(region.start, window_size),
            window_start(region.end, window_size).saturating_add(window_size - 1),
        )
    }

    /// Destination file name of a scratch output, `None` if it is no shard file.
    fn destination_name(&self, file_name: &str) -> Option<String> {
        if self.descriptor.is_shard_file(file_name) {
            Some(file_name.to_string())
        } else if file_name.ends_with(".json") {
            let gz_name = format!("{}.gz", file_name);
            self.descriptor.is_shard_file(&gz_name).then_some(gz_name)
        } else {
            None
        }
    }

    /// Files in `scratch` and its direct subdirectories.
    fn list_scratch_files(&self, scratch: &Path) -> Result<Vec<FileStatus>, anyhow::Error> {
        let mut result = Vec::new();
        for status in self.fs.list(scratch)? {
            if status.is_dir {
                result.extend(self.fs.list(&status.path)?.into_iter().filter(|s| !s.is_dir));
            } else {
                result.push(status);
            }
        }
        result.sort();
        Ok(result)
    }

    /// Move the shard files of a finished discovery run into the pending directory.
    ///
    /// All destinations are computed first; two outputs mapping to the same
    /// destination fail the run before anything is renamed.  Existing shards are
    /// replaced, not merged.  On success the scratch directory is removed.
    pub fn move_scratch(
        &self,
        scratch: &Path,
        config: &DiscoveryConfig,
    ) -> Result<MoveSummary, anyhow::Error> {
        let mut moves: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
        for status in self.list_scratch_files(scratch)? {
            let Some(name) = self.destination_name(status.file_name()) else {
                tracing::debug!("ignoring scratch file {:?}", &status.path);
                continue;
            };
            let destination = self.dir.join(name);
            if let Some(first) = moves.get(&destination) {
                return Err(PendingError::ShardCollision {
                    destination,
                    first: first.clone(),
                    second: status.path,
                }
                .into());
            }
            moves.insert(destination, status.path);
        }

        let mut summary = MoveSummary::default();
        if config.overwrite {
            for shard in self.list_shards()? {
                let in_scope = config.regions.is_empty()
                    || config
                        .regions
                        .iter()
                        .any(|region| region.contains(&shard.chrom, shard.window_start));
                if in_scope && !moves.contains_key(&shard.path) {
                    tracing::debug!("overwrite: removing stale shard {:?}", &shard.path);
                    if self.fs.delete(&shard.path, false)? {
                        summary.removed += 1;
                    }
                }
            }
        }

        for (destination, source) in &moves {
            if self.fs.exists(destination)? {
                self.fs.delete(destination, false)?;
                summary.replaced += 1;
            }
            if !self.fs.rename(source, destination)? {
                anyhow::bail!("could not move {:?} to {:?}", source, destination);
            }
            summary.moved += 1;
        }

        self.fs.delete(scratch, true)?;
        // Concurrent runs may have created their own scratch directory meanwhile.
        let scratch_root = self.dir.join(SCRATCH_DIR);
        if let Err(e) = self.fs.delete(&scratch_root, false) {
            tracing::debug!("keeping scratch root {:?}: {}", &scratch_root, e);
        }

        tracing::info!(
            "moved {} shard files into {:?} ({} replaced, {} stale removed)",
            summary.moved,
            &self.dir,
            summary.replaced,
            summary.removed
        );
        Ok(summary)
    }
}

impl PendingVariantsManager for FilePendingVariantsManager {
    fn descriptor_name(&self) -> &str {
        self.descriptor.name()
    }

    fn reader<'a>(
        &'a self,
        query: &PendingQuery,
    ) -> Result<Box<dyn PendingReader + 'a>, anyhow::Error> {
        Ok(Box::new(FilePendingReader::new(self, query.regions.clone())))
    }

    fn cleaner<'a>(&'a self) -> Result<Box<dyn PendingCleaner + 'a>, anyhow::Error> {
        Ok(Box::new(FilePendingCleaner::new(self)))
    }

    fn discover_pending(
        &self,
        primary: &PrimaryStore,
        config: &DiscoveryConfig,
    ) -> Result<DiscoveryCounters, anyhow::Error> {
        let config = DiscoveryConfig {
            regions: config
                .regions
                .iter()
                .map(|region| self.window_aligned(region))
                .collect(),
            ..config.clone()
        };
        let target = FileDiscoveryTarget {
            manager: self,
            scratch: self.new_scratch_dir(),
        };
        discovery::run(primary, self.descriptor.as_ref(), &target, &config)
    }

    fn exists(&self) -> Result<bool, anyhow::Error> {
        self.fs.exists(&self.dir)
    }

    fn delete(&self) -> Result<(), anyhow::Error> {
        if self.fs.delete(&self.dir, true)? {
            tracing::info!("deleted pending directory {:?}", &self.dir);
        }
        Ok(())
    }

    fn check_integrity(&self) -> Result<(), anyhow::Error> {
        let shards = self.list_shards()?;
        let mut count = 0;
        for shard in &shards {
            count += shard::read_shard(self.fs.as_ref(), &shard.path)?.len();
        }
        tracing::info!(
            "{} shard files in {:?} are readable, {} variants",
            shards.len(),
            &self.dir,
            count
        );
        Ok(())
    }
}

struct FileDiscoveryTarget<'a> {
    manager: &'a FilePendingVariantsManager,
    scratch: PathBuf,
}

impl DiscoveryTarget for FileDiscoveryTarget<'_> {
    fn prepare(&self, _config: &DiscoveryConfig) -> Result<(), anyhow::Error> {
        self.manager.fs.mkdirs(&self.manager.dir)?;
        self.manager.verify_ownership()?;
        self.manager.fs.mkdirs(&self.scratch)?;
        tracing::info!("writing discovery output to {:?}", &self.scratch);
        Ok(())
    }

    fn sink<'s>(
        &'s self,
        index: usize,
        _partition: &Partition,
    ) -> Result<Box<dyn DiscoverySink + 's>, anyhow::Error> {
        Ok(Box::new(FileDiscoverySink {
            manager: self.manager,
            part_dir: self.scratch.join(format!("part-{:05}", index)),
            current: None,
            written: HashSet::new(),
        }))
    }

    fn commit(&self, config: &DiscoveryConfig) -> Result<(), anyhow::Error> {
        self.manager.move_scratch(&self.scratch, config)?;
        Ok(())
    }
}

/// Writes the pending variants of one partition, one shard at a time.
///
/// Records arrive in key order, so each window is written in one go.
struct FileDiscoverySink<'a> {
    manager: &'a FilePendingVariantsManager,
    part_dir: PathBuf,
    current: Option<(String, shard::ShardWriter)>,
    written: HashSet<String>,
}

impl FileDiscoverySink<'_> {
    fn close_current(&mut self) -> Result<(), anyhow::Error> {
        if let Some((name, writer)) = self.current.take() {
            writer.finish()?;
            self.written.insert(name);
        }
        Ok(())
    }
}

impl DiscoverySink for FileDiscoverySink<'_> {
    fn apply(
        &mut self,
        record: &PrimaryRecord,
        evaluation: Evaluation,
    ) -> Result<(), anyhow::Error> {
        if evaluation != Evaluation::Pending {
            return Ok(());
        }
        let variant = record.variant()?;
        let name = self
            .manager
            .descriptor
            .shard_name(&variant.chromosome, variant.position);

        if self.current.as_ref().map(|(current, _)| current) != Some(&name) {
            self.close_current()?;
            if self.written.contains(&name) {
                anyhow::bail!("shard {} revisited within partition at {}", name, &variant);
            }
            if self.written.is_empty() {
                self.manager.fs.mkdirs(&self.part_dir)?;
            }
            let writer = shard::ShardWriter::create(
                self.manager.fs.as_ref(),
                &self.part_dir.join(&name),
            )?;
            self.current = Some((name, writer));
        }
        if let Some((_, writer)) = self.current.as_mut() {
            writer.write(&variant)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), anyhow::Error> {
        self.close_current()
    }
}
