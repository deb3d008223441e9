//! Bookkeeping of variants that still require a deferred operation.
//!
//! A `PendingVariantsManager` binds a descriptor (the policy deciding what is
//! pending and how it is named) to one backing store, either a RocksDB column
//! family (`table`) or a directory of windowed shard files (`file`).  Callers
//! read pending variants, process them, and hand processed variants to a
//! cleaner.  The discovery job resynchronizes the pending set with the primary
//! store.

use std::collections::VecDeque;

use crate::primary::PrimaryStore;
use crate::variant::{Region, Variant};

pub mod cli;
pub mod descriptor;
pub mod discovery;
pub mod file;
pub mod table;

pub use descriptor::{FilePendingDescriptor, PendingDescriptor, TablePendingDescriptor};
pub use discovery::{DiscoveryConfig, DiscoveryConfigBuilder, DiscoveryCounters};

/// Default number of variants per `PendingReader::read` call.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Outcome of evaluating one primary store record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Evaluation {
    /// The deferred operation was performed.
    Ready,
    /// The deferred operation is still required.
    Pending,
    /// The record must be removed from the pending set in any case.
    NoLongerPending,
}

/// Query for pending variants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingQuery {
    /// Restrict to these regions, empty for everything.
    pub regions: Vec<Region>,
}

impl PendingQuery {
    /// Build query from region strings such as `1:1000-2000`.
    pub fn from_region_strs<S>(regions: &[S]) -> Result<Self, anyhow::Error>
    where
        S: AsRef<str>,
    {
        let regions = regions
            .iter()
            .map(|s| s.as_ref().parse::<Region>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { regions })
    }
}

/// Batch reader of pending variants.
///
/// The lifecycle is `open`, `pre`, any number of `read`, `post`, `close`.
pub trait PendingReader {
    fn open(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
    fn pre(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
    /// Read up to `batch_size` variants, an empty result marks the end.
    fn read(&mut self, batch_size: usize) -> Result<Vec<Variant>, anyhow::Error>;
    fn post(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Sink for variants whose deferred operation was performed.
///
/// `success` and `abort` are the terminal calls; `close` must never remove
/// anything that was not committed.
pub trait PendingCleaner {
    fn pre(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
    fn write(&mut self, variants: &[Variant]) -> Result<(), anyhow::Error>;
    fn close(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }
    /// The whole processing batch completed.
    fn success(&mut self) -> Result<(), anyhow::Error>;
    /// Processing failed, keep everything not yet removed.
    fn abort(&mut self) -> Result<(), anyhow::Error>;
}

/// Pull-style iteration over a `PendingReader`.
pub struct PendingIterator<'a> {
    reader: Box<dyn PendingReader + 'a>,
    batch_size: usize,
    buffer: VecDeque<Variant>,
    started: bool,
    done: bool,
}

impl<'a> PendingIterator<'a> {
    pub fn new(reader: Box<dyn PendingReader + 'a>, batch_size: usize) -> Self {
        Self {
            reader,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            started: false,
            done: false,
        }
    }

    fn fill(&mut self) -> Result<(), anyhow::Error> {
        if !self.started {
            self.started = true;
            self.reader.open()?;
            self.reader.pre()?;
        }
        let batch = self.reader.read(self.batch_size)?;
        if batch.is_empty() {
            self.finish()?;
        } else {
            self.buffer.extend(batch);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), anyhow::Error> {
        if !self.done {
            self.done = true;
            self.reader.post()?;
            self.reader.close()?;
        }
        Ok(())
    }
}

impl Iterator for PendingIterator<'_> {
    type Item = Result<Variant, anyhow::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                // Release the reader and stop after reporting the first error.
                self.done = true;
                let _ = self.reader.close();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Binds a descriptor to one backing store.
pub trait PendingVariantsManager {
    /// Name of the descriptor this manager is bound to.
    fn descriptor_name(&self) -> &str;

    fn reader<'a>(
        &'a self,
        query: &PendingQuery,
    ) -> Result<Box<dyn PendingReader + 'a>, anyhow::Error>;

    fn iterator<'a>(
        &'a self,
        query: &PendingQuery,
        batch_size: usize,
    ) -> Result<PendingIterator<'a>, anyhow::Error> {
        Ok(PendingIterator::new(self.reader(query)?, batch_size))
    }

    fn cleaner<'a>(&'a self) -> Result<Box<dyn PendingCleaner + 'a>, anyhow::Error>;

    /// Resynchronize the pending set with `primary`.
    fn discover_pending(
        &self,
        primary: &PrimaryStore,
        config: &DiscoveryConfig,
    ) -> Result<DiscoveryCounters, anyhow::Error>;

    fn exists(&self) -> Result<bool, anyhow::Error>;

    /// Remove the whole pending store.
    fn delete(&self) -> Result<(), anyhow::Error>;

    /// Read everything once, reporting the first unreadable entry.
    fn check_integrity(&self) -> Result<(), anyhow::Error>;
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Reader handing out fixed batches and recording its lifecycle.
    struct VecReader {
        batches: VecDeque<Vec<Variant>>,
        calls: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        fail_on_read: bool,
    }

    impl PendingReader for VecReader {
        fn open(&mut self) -> Result<(), anyhow::Error> {
            self.calls.borrow_mut().push("open");
            Ok(())
        }
        fn pre(&mut self) -> Result<(), anyhow::Error> {
            self.calls.borrow_mut().push("pre");
            Ok(())
        }
        fn read(&mut self, _batch_size: usize) -> Result<Vec<Variant>, anyhow::Error> {
            self.calls.borrow_mut().push("read");
            if self.fail_on_read {
                anyhow::bail!("broken");
            }
            Ok(self.batches.pop_front().unwrap_or_default())
        }
        fn post(&mut self) -> Result<(), anyhow::Error> {
            self.calls.borrow_mut().push("post");
            Ok(())
        }
        fn close(&mut self) -> Result<(), anyhow::Error> {
            self.calls.borrow_mut().push("close");
            Ok(())
        }
    }

    #[test]
    fn iterator_drives_lifecycle() -> Result<(), anyhow::Error> {
        let calls = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let reader = VecReader {
            batches: VecDeque::from(vec![
                vec![Variant::new("1", 1, "A", "C"), Variant::new("1", 2, "A", "C")],
                vec![Variant::new("2", 1, "A", "C")],
            ]),
            calls: calls.clone(),
            fail_on_read: false,
        };

        let variants = PendingIterator::new(Box::new(reader), 2).collect::<Result<Vec<_>, _>>()?;

        assert_eq!(variants.len(), 3);
        assert_eq!(
            *calls.borrow(),
            vec!["open", "pre", "read", "read", "read", "post", "close"]
        );

        Ok(())
    }

    #[test]
    fn iterator_stops_after_error() {
        let calls = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let reader = VecReader {
            batches: VecDeque::new(),
            calls: calls.clone(),
            fail_on_read: true,
        };

        let mut iter = PendingIterator::new(Box::new(reader), 2);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
        assert_eq!(*calls.borrow(), vec!["open", "pre", "read", "close"]);
    }

    #[test]
    fn query_from_region_strs() -> Result<(), anyhow::Error> {
        let query = PendingQuery::from_region_strs(&["1:1-10", "X"])?;
        assert_eq!(
            query.regions,
            vec![Region::new("1", 1, 10), Region::chromosome("X")]
        );
        assert!(PendingQuery::from_region_strs(&["1:x"]).is_err());

        Ok(())
    }

    #[test]
    fn evaluation_display() {
        assert_eq!(Evaluation::NoLongerPending.to_string(), "NO_LONGER_PENDING");
    }
}
