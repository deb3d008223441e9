//! Deletes shard files once the variants read from them were processed.

use std::path::PathBuf;

use indexmap::IndexSet;
use thousands::Separable;

use crate::err::PendingError;
use crate::pending::PendingCleaner;
use crate::variant::Variant;

use super::FilePendingVariantsManager;

/// Number of candidate files kept back while accumulating.
///
/// Other variants of a recently seen shard are likely still being processed.
pub const LOW_WATER_MARK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CleanerState {
    Accumulating,
    Committed,
    Aborted,
}

/// Cleaner for the file-backed pending store.
///
/// Shard files of written variants become deletion candidates in insertion
/// order.  Only candidates beyond `LOW_WATER_MARK` are deleted while
/// accumulating, `success` deletes the rest and `abort` keeps them.  Not
/// thread-safe, use one cleaner per processing pipeline.
pub struct FilePendingCleaner<'a> {
    manager: &'a FilePendingVariantsManager,
    candidates: IndexSet<PathBuf>,
    state: CleanerState,
    deleted: usize,
}

impl<'a> FilePendingCleaner<'a> {
    pub fn new(manager: &'a FilePendingVariantsManager) -> Self {
        Self {
            manager,
            candidates: IndexSet::new(),
            state: CleanerState::Accumulating,
            deleted: 0,
        }
    }

    pub fn state(&self) -> CleanerState {
        self.state
    }

    /// Current deletion candidates, oldest first.
    pub fn candidates(&self) -> impl Iterator<Item = &PathBuf> {
        self.candidates.iter()
    }

    /// Number of files deleted so far.
    pub fn deleted(&self) -> usize {
        self.deleted
    }

    fn ensure_accumulating(&self) -> Result<(), PendingError> {
        match self.state {
            CleanerState::Accumulating => Ok(()),
            CleanerState::Committed => Err(PendingError::CleanerFinished("committed")),
            CleanerState::Aborted => Err(PendingError::CleanerFinished("aborted")),
        }
    }

    /// Delete the oldest candidates until at most `mark` are left.
    fn trim(&mut self, mark: usize) -> Result<(), anyhow::Error> {
        while self.candidates.len() > mark {
            let path = self
                .candidates
                .shift_remove_index(0)
                .expect("checked length above");
            tracing::debug!("deleting processed shard {:?}", &path);
            if self.manager.fs.delete(&path, false)? {
                self.deleted += 1;
            } else {
                tracing::trace!("shard {:?} was already gone", &path);
            }
        }
        Ok(())
    }
}

impl PendingCleaner for FilePendingCleaner<'_> {
    fn write(&mut self, variants: &[Variant]) -> Result<(), anyhow::Error> {
        self.ensure_accumulating()?;
        for variant in variants {
            self.candidates
                .insert(self.manager.shard_path(&variant.chromosome, variant.position));
        }
        self.trim(LOW_WATER_MARK)
    }

    fn close(&mut self) -> Result<(), anyhow::Error> {
        // May run on failure paths, so never delete here.
        if !self.candidates.is_empty() {
            tracing::debug!(
                "closing cleaner in state {} with {} pending deletions",
                self.state,
                self.candidates.len()
            );
        }
        Ok(())
    }

    fn success(&mut self) -> Result<(), anyhow::Error> {
        self.ensure_accumulating()?;
        self.trim(0)?;
        self.state = CleanerState::Committed;
        tracing::info!(
            "deleted {} processed pending files",
            self.deleted.separate_with_commas()
        );
        Ok(())
    }

    fn abort(&mut self) -> Result<(), anyhow::Error> {
        self.ensure_accumulating()?;
        let skipped = self.candidates.len();
        self.candidates.clear();
        self.state = CleanerState::Aborted;
        tracing::info!(
            "aborted, skipped deletion of {} pending files ({} deleted before)",
            skipped.separate_with_commas(),
            self.deleted.separate_with_commas()
        );
        Ok(())
    }
}
