//! Sequential reader over the shard files of a pending directory.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::pending::PendingReader;
use crate::variant::{Region, Variant};

use super::shard::ShardReader;
use super::FilePendingVariantsManager;

/// Reads the shard files one after another, sorted by path.
///
/// With regions given, only shards whose window start lies in one of them are
/// read.  Records are not clipped to the regions.
pub struct FilePendingReader<'a> {
    manager: &'a FilePendingVariantsManager,
    regions: Vec<Region>,
    files: VecDeque<PathBuf>,
    current: Option<ShardReader>,
    opened: bool,
}

impl<'a> FilePendingReader<'a> {
    pub fn new(manager: &'a FilePendingVariantsManager, regions: Vec<Region>) -> Self {
        Self {
            manager,
            regions,
            files: VecDeque::new(),
            current: None,
            opened: false,
        }
    }

    fn selects(&self, chrom: &str, window_start: u32) -> bool {
        self.regions.is_empty()
            || self
                .regions
                .iter()
                .any(|region| region.contains(chrom, window_start))
    }

    fn open_next(&mut self) -> Result<bool, anyhow::Error> {
        self.current = None;
        match self.files.pop_front() {
            Some(path) => {
                self.current = Some(ShardReader::open(self.manager.fs.as_ref(), &path)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl PendingReader for FilePendingReader<'_> {
    fn open(&mut self) -> Result<(), anyhow::Error> {
        let shards = self.manager.list_shards()?;
        let total = shards.len();
        let mut files = shards
            .into_iter()
            .filter(|shard| self.selects(&shard.chrom, shard.window_start))
            .map(|shard| shard.path)
            .collect::<Vec<_>>();
        files.sort();
        tracing::debug!(
            "reading {} of {} shard files in {:?}",
            files.len(),
            total,
            self.manager.dir()
        );
        self.files = files.into();
        self.opened = true;
        Ok(())
    }

    fn pre(&mut self) -> Result<(), anyhow::Error> {
        if self.current.is_none() {
            self.open_next()?;
        }
        Ok(())
    }

    fn read(&mut self, batch_size: usize) -> Result<Vec<Variant>, anyhow::Error> {
        if !self.opened {
            self.open()?;
        }
        let batch_size = batch_size.max(1);
        let mut result = Vec::with_capacity(batch_size);
        while result.len() < batch_size {
            let next = match self.current.as_mut() {
                Some(reader) => reader.next_variant()?,
                None => {
                    if self.open_next()? {
                        continue;
                    } else {
                        break;
                    }
                }
            };
            match next {
                Some(variant) => result.push(variant),
                None => {
                    if !self.open_next()? {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    fn close(&mut self) -> Result<(), anyhow::Error> {
        self.current = None;
        Ok(())
    }
}
