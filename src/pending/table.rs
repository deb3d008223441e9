//! Pending store kept in a dedicated RocksDB column family.
//!
//! Rows use the primary store key scheme with empty values.

use std::collections::VecDeque;
use std::sync::Arc;

use thousands::Separable;

use crate::err::PendingError;
use crate::primary::{Db, Partition, PrimaryRecord, PrimaryStore, CF_META, CF_VARIANTS};
use crate::variant::Variant;

use super::descriptor::TableMutation;
use super::discovery::{self, DiscoverySink, DiscoveryTarget};
use super::{
    DiscoveryConfig, DiscoveryCounters, Evaluation, PendingCleaner, PendingQuery, PendingReader,
    PendingVariantsManager, TablePendingDescriptor,
};

/// `PendingVariantsManager` on a RocksDB column family.
pub struct TablePendingVariantsManager {
    db: Arc<Db>,
    descriptor: Arc<dyn TablePendingDescriptor>,
    table: String,
}

impl std::fmt::Debug for TablePendingVariantsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TablePendingVariantsManager")
            .field("descriptor", &self.descriptor.name())
            .field("table", &self.table)
            .finish()
    }
}

impl TablePendingVariantsManager {
    /// Bind `descriptor` to the column family `table` (default from the descriptor)
    /// in the database of `primary`.
    pub fn new(
        primary: &PrimaryStore,
        descriptor: Arc<dyn TablePendingDescriptor>,
        table: Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let table = table.unwrap_or_else(|| descriptor.table_name());
        if !table.starts_with(descriptor.name()) || table == CF_META || table == CF_VARIANTS {
            return Err(PendingError::DescriptorMismatch {
                descriptor: descriptor.name().to_string(),
                store: table,
            }
            .into());
        }
        Ok(Self {
            db: primary.db().clone(),
            descriptor,
            table,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the column family if missing.
    pub fn ensure_table(&self) -> Result<(), anyhow::Error> {
        if self.db.cf_handle(&self.table).is_none() {
            tracing::info!("creating pending table {}", &self.table);
            self.db
                .create_cf(&self.table, &rocksdb::Options::default())
                .map_err(|e| anyhow::anyhow!("could not create table {}: {}", &self.table, e))?;
        }
        Ok(())
    }

    fn cf(&self) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, anyhow::Error> {
        self.db
            .cf_handle(&self.table)
            .ok_or_else(|| anyhow::anyhow!("pending table {} does not exist", &self.table))
    }

    /// Remove all rows in the scope of `config`.
    fn clear_scope(&self, config: &DiscoveryConfig) -> Result<(), anyhow::Error> {
        if config.regions.is_empty() {
            tracing::info!("overwrite: recreating pending table {}", &self.table);
            self.delete()?;
            return self.ensure_table();
        }
        let cf = self.cf()?;
        for region in &config.regions {
            tracing::debug!("overwrite: clearing {} in {}", region, &self.table);
            let (lower, upper) = region.key_range();
            self.db
                .delete_range_cf(&cf, lower, upper)
                .map_err(|e| anyhow::anyhow!("could not clear {} in {}: {}", region, &self.table, e))?;
        }
        Ok(())
    }
}

impl PendingVariantsManager for TablePendingVariantsManager {
    fn descriptor_name(&self) -> &str {
        self.descriptor.name()
    }

    fn reader<'a>(
        &'a self,
        query: &PendingQuery,
    ) -> Result<Box<dyn PendingReader + 'a>, anyhow::Error> {
        Ok(Box::new(TablePendingReader::new(self, query)))
    }

    fn cleaner<'a>(&'a self) -> Result<Box<dyn PendingCleaner + 'a>, anyhow::Error> {
        Ok(Box::new(TablePendingCleaner::new(self)))
    }

    fn discover_pending(
        &self,
        primary: &PrimaryStore,
        config: &DiscoveryConfig,
    ) -> Result<DiscoveryCounters, anyhow::Error> {
        let target = TableDiscoveryTarget {
            manager: self,
            write_batch_size: config.write_batch_size,
        };
        discovery::run(primary, self.descriptor.as_ref(), &target, config)
    }

    fn exists(&self) -> Result<bool, anyhow::Error> {
        Ok(self.db.cf_handle(&self.table).is_some())
    }

    fn delete(&self) -> Result<(), anyhow::Error> {
        if self.exists()? {
            self.db
                .drop_cf(&self.table)
                .map_err(|e| anyhow::anyhow!("could not drop table {}: {}", &self.table, e))?;
        }
        Ok(())
    }

    fn check_integrity(&self) -> Result<(), anyhow::Error> {
        let mut reader = TablePendingReader::new(self, &PendingQuery::default());
        let mut count = 0usize;
        loop {
            let batch = reader.read(super::DEFAULT_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            count += batch.len();
        }
        tracing::info!(
            "pending table {} is readable, {} rows",
            &self.table,
            count.separate_with_commas()
        );
        Ok(())
    }
}

/// Reads pending rows back as variants, one key range per requested region.
pub struct TablePendingReader<'a> {
    manager: &'a TablePendingVariantsManager,
    /// Remaining `[lower, upper)` key ranges, `None` for unbounded.
    ranges: VecDeque<(Vec<u8>, Option<Vec<u8>>)>,
    /// Where to continue inside the first range.
    cursor: Option<Vec<u8>>,
}

impl<'a> TablePendingReader<'a> {
    pub fn new(manager: &'a TablePendingVariantsManager, query: &PendingQuery) -> Self {
        let ranges = if query.regions.is_empty() {
            VecDeque::from(vec![(Vec::new(), None)])
        } else {
            query
                .regions
                .iter()
                .map(|region| {
                    let (lower, upper) = region.key_range();
                    (lower, Some(upper))
                })
                .collect()
        };
        Self {
            manager,
            ranges,
            cursor: None,
        }
    }
}

impl PendingReader for TablePendingReader<'_> {
    fn read(&mut self, batch_size: usize) -> Result<Vec<Variant>, anyhow::Error> {
        let batch_size = batch_size.max(1);
        let Some(cf) = self.manager.db.cf_handle(&self.manager.table) else {
            return Ok(Vec::new());
        };

        let mut result = Vec::with_capacity(batch_size);
        while let Some((lower, upper)) = self.ranges.front() {
            let mut readopts = rocksdb::ReadOptions::default();
            if let Some(upper) = upper {
                readopts.set_iterate_upper_bound(upper.clone());
            }
            let start = self.cursor.take().unwrap_or_else(|| lower.clone());
            let mut iter = self.manager.db.raw_iterator_cf_opt(&cf, readopts);
            iter.seek(&start);

            while let Some(key) = iter.key() {
                if result.len() >= batch_size {
                    self.cursor = Some(key.to_vec());
                    return Ok(result);
                }
                result.push(Variant::from_key(key).map_err(|e| {
                    anyhow::anyhow!("bad row in table {}: {}", &self.manager.table, e)
                })?);
                iter.next();
            }
            iter.status().map_err(|e| {
                anyhow::anyhow!("problem reading table {}: {}", &self.manager.table, e)
            })?;
            self.ranges.pop_front();
        }
        Ok(result)
    }
}

/// Deletes the rows of processed variants right away.
pub struct TablePendingCleaner<'a> {
    manager: &'a TablePendingVariantsManager,
    deleted: usize,
}

impl<'a> TablePendingCleaner<'a> {
    pub fn new(manager: &'a TablePendingVariantsManager) -> Self {
        Self {
            manager,
            deleted: 0,
        }
    }

    /// Delete the given row keys in one write batch.
    pub fn write_keys(&mut self, keys: &[Vec<u8>]) -> Result<(), anyhow::Error> {
        let cf = self.manager.cf()?;
        let mut batch = rocksdb::WriteBatch::default();
        for key in keys {
            batch.delete_cf(&cf, key);
        }
        self.manager.db.write(batch).map_err(|e| {
            anyhow::anyhow!(
                "could not delete {} rows from {}: {}",
                keys.len(),
                &self.manager.table,
                e
            )
        })?;
        self.deleted += keys.len();
        Ok(())
    }
}

impl PendingCleaner for TablePendingCleaner<'_> {
    fn pre(&mut self) -> Result<(), anyhow::Error> {
        self.manager.ensure_table()
    }

    fn write(&mut self, variants: &[Variant]) -> Result<(), anyhow::Error> {
        let keys = variants.iter().map(Variant::to_key).collect::<Vec<_>>();
        self.write_keys(&keys)
    }

    fn success(&mut self) -> Result<(), anyhow::Error> {
        tracing::info!(
            "removed {} rows from pending table {}",
            self.deleted.separate_with_commas(),
            &self.manager.table
        );
        Ok(())
    }

    fn abort(&mut self) -> Result<(), anyhow::Error> {
        tracing::info!(
            "aborted, {} rows were already removed from pending table {}",
            self.deleted.separate_with_commas(),
            &self.manager.table
        );
        Ok(())
    }
}

struct TableDiscoveryTarget<'a> {
    manager: &'a TablePendingVariantsManager,
    write_batch_size: usize,
}

impl DiscoveryTarget for TableDiscoveryTarget<'_> {
    fn prepare(&self, config: &DiscoveryConfig) -> Result<(), anyhow::Error> {
        self.manager.ensure_table()?;
        if config.overwrite {
            self.manager.clear_scope(config)?;
        }
        Ok(())
    }

    fn sink<'s>(
        &'s self,
        _index: usize,
        _partition: &Partition,
    ) -> Result<Box<dyn DiscoverySink + 's>, anyhow::Error> {
        Ok(Box::new(TableDiscoverySink {
            manager: self.manager,
            cf: self.manager.cf()?,
            batch: rocksdb::WriteBatch::default(),
            write_batch_size: self.write_batch_size,
        }))
    }

    fn commit(&self, _config: &DiscoveryConfig) -> Result<(), anyhow::Error> {
        if !self.manager.exists()? {
            anyhow::bail!("pending table {} vanished during discovery", self.manager.table);
        }
        Ok(())
    }
}

struct TableDiscoverySink<'a> {
    manager: &'a TablePendingVariantsManager,
    cf: Arc<rocksdb::BoundColumnFamily<'a>>,
    batch: rocksdb::WriteBatch,
    write_batch_size: usize,
}

impl TableDiscoverySink<'_> {
    fn flush(&mut self) -> Result<(), anyhow::Error> {
        if !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            self.manager.db.write(batch).map_err(|e| {
                anyhow::anyhow!("problem writing to table {}: {}", &self.manager.table, e)
            })?;
        }
        Ok(())
    }
}

impl DiscoverySink for TableDiscoverySink<'_> {
    fn apply(
        &mut self,
        record: &PrimaryRecord,
        evaluation: Evaluation,
    ) -> Result<(), anyhow::Error> {
        match self.manager.descriptor.build_mutation(record, evaluation) {
            TableMutation::Put { key } => self.batch.put_cf(&self.cf, key, b""),
            TableMutation::Delete { key, if_present } => {
                let present = !if_present
                    || self
                        .manager
                        .db
                        .get_pinned_cf(&self.cf, &key)
                        .map_err(|e| {
                            anyhow::anyhow!("problem reading row key {:?}: {}", &key, e)
                        })?
                        .is_some();
                if present {
                    self.batch.delete_cf(&self.cf, key);
                }
            }
        }
        if self.batch.len() >= self.write_batch_size.max(1) {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), anyhow::Error> {
        self.flush()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pending::descriptor::AnnotationPendingDescriptor;
    use crate::pending::DiscoveryConfigBuilder;
    use crate::primary::test::store_with;
    use crate::primary::StoredRecord;

    fn manager(primary: &PrimaryStore) -> TablePendingVariantsManager {
        TablePendingVariantsManager::new(primary, Arc::new(AnnotationPendingDescriptor), None)
            .unwrap()
    }

    fn read_all(
        manager: &TablePendingVariantsManager,
        query: &PendingQuery,
    ) -> Result<Vec<Variant>, anyhow::Error> {
        manager.iterator(query, 1)?.collect()
    }

    #[test]
    fn table_name_must_match_descriptor() {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(&tmp_dir, &[]).unwrap();
        let err = TablePendingVariantsManager::new(
            &primary,
            Arc::new(AnnotationPendingDescriptor),
            Some("other_pending".into()),
        )
        .unwrap_err();

        assert_eq!(
            err.downcast_ref::<PendingError>(),
            Some(&PendingError::DescriptorMismatch {
                descriptor: "annotation".into(),
                store: "other_pending".into()
            })
        );
    }

    #[test]
    fn missing_table_reads_empty() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(&tmp_dir, &[("1", 10, None)])?;
        let manager = manager(&primary);

        assert_eq!(manager.table(), "annotation_pending");
        assert!(!manager.exists()?);
        assert_eq!(read_all(&manager, &PendingQuery::default())?, vec![]);

        Ok(())
    }

    #[test]
    fn discover_read_clean() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(
            &tmp_dir,
            &[
                ("1", 500_000, Some("v1")),
                ("1", 1_500_000, None),
                ("2", 10, None),
            ],
        )?;
        primary.set_annotation_id("v1")?;
        let manager = manager(&primary);

        let counters = manager.discover_pending(&primary, &DiscoveryConfig::default())?;
        assert_eq!(
            counters,
            DiscoveryCounters {
                scanned: 3,
                ready: 1,
                pending: 2
            }
        );
        assert!(manager.exists()?);
        assert_eq!(
            read_all(&manager, &PendingQuery::default())?,
            vec![
                Variant::new("1", 1_500_000, "A", "G"),
                Variant::new("2", 10, "A", "G")
            ]
        );
        assert_eq!(
            read_all(&manager, &PendingQuery::from_region_strs(&["2"])?)?,
            vec![Variant::new("2", 10, "A", "G")]
        );
        manager.check_integrity()?;

        let mut cleaner = manager.cleaner()?;
        cleaner.pre()?;
        cleaner.write(&[Variant::new("2", 10, "A", "G")])?;
        cleaner.close()?;
        cleaner.success()?;
        assert_eq!(
            read_all(&manager, &PendingQuery::default())?,
            vec![Variant::new("1", 1_500_000, "A", "G")]
        );

        Ok(())
    }

    #[test]
    fn ready_variant_removed_on_rediscovery() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(&tmp_dir, &[("1", 100, None), ("1", 200, None)])?;
        primary.set_annotation_id("v1")?;
        let manager = manager(&primary);

        manager.discover_pending(&primary, &DiscoveryConfig::default())?;
        assert_eq!(read_all(&manager, &PendingQuery::default())?.len(), 2);

        // annotate one of them and discover again
        primary.put(
            &Variant::new("1", 100, "A", "G"),
            &StoredRecord {
                annotation_id: Some("v1".into()),
                annotation: None,
            },
        )?;
        let counters = manager.discover_pending(&primary, &DiscoveryConfig::default())?;

        assert_eq!(counters.ready, 1);
        assert_eq!(
            read_all(&manager, &PendingQuery::default())?,
            vec![Variant::new("1", 200, "A", "G")]
        );

        Ok(())
    }

    #[test]
    fn overwrite_clears_rows_gone_from_primary() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(&tmp_dir, &[("1", 100, None), ("2", 200, None)])?;
        let manager = manager(&primary);
        manager.discover_pending(&primary, &DiscoveryConfig::default())?;

        primary.delete(&Variant::new("1", 100, "A", "G"))?;
        primary.delete(&Variant::new("2", 200, "A", "G"))?;
        let config = DiscoveryConfigBuilder::default()
            .regions(vec!["1".parse()?])
            .overwrite(true)
            .build()?;
        manager.discover_pending(&primary, &config)?;

        assert_eq!(
            read_all(&manager, &PendingQuery::default())?,
            vec![Variant::new("2", 200, "A", "G")]
        );

        Ok(())
    }

    #[test]
    fn reader_batches_across_ranges() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(
            &tmp_dir,
            &[("1", 1, None), ("1", 2, None), ("1", 3, None), ("2", 1, None)],
        )?;
        let manager = manager(&primary);
        manager.discover_pending(&primary, &DiscoveryConfig::default())?;

        let query = PendingQuery::from_region_strs(&["1:2-3", "2"])?;
        let mut reader = manager.reader(&query)?;
        assert_eq!(reader.read(1)?, vec![Variant::new("1", 2, "A", "G")]);
        assert_eq!(
            reader.read(2)?,
            vec![Variant::new("1", 3, "A", "G"), Variant::new("2", 1, "A", "G")]
        );
        assert_eq!(reader.read(2)?, vec![]);

        Ok(())
    }

    #[test]
    fn delete_drops_table() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let primary = store_with(&tmp_dir, &[("1", 1, None)])?;
        let manager = manager(&primary);
        manager.discover_pending(&primary, &DiscoveryConfig::default())?;

        manager.delete()?;
        assert!(!manager.exists()?);
        manager.delete()?;

        Ok(())
    }
}
