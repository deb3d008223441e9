//! Access to the primary variant store in RocksDB.

use std::sync::Arc;

use crate::variant::{chrom_upper_bound, Locus, Region, Variant};

pub mod import;

/// Column family holding the metadata.
pub const CF_META: &str = "meta";
/// Column family holding the variant records.
pub const CF_VARIANTS: &str = "variants";
/// Key of the current annotation run identifier in the metadata.
pub const META_ANNOTATION_ID: &str = "annotation-id";

/// The RocksDB database type shared by primary and table-backed pending store.
pub type Db = rocksdb::DBWithThreadMode<rocksdb::MultiThreaded>;

/// Value stored for each variant in the primary store.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredRecord {
    /// Identifier of the annotation run the annotation stems from, if annotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_id: Option<String>,
    /// Opaque annotation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<serde_json::Value>,
}

/// Overall store metadata handed to the pending descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Identifier of the current annotation run.
    pub annotation_id: Option<String>,
}

/// Tuning of scans over the primary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Whether blocks read by the scan populate the block cache.
    pub fill_cache: bool,
    /// Read-ahead size in bytes, `0` leaves the RocksDB default.
    pub readahead_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            fill_cache: true,
            readahead_size: 0,
        }
    }
}

impl ScanOptions {
    fn read_options(&self, upper: Vec<u8>) -> rocksdb::ReadOptions {
        let mut readopts = rocksdb::ReadOptions::default();
        readopts.fill_cache(self.fill_cache);
        if self.readahead_size > 0 {
            readopts.set_readahead_size(self.readahead_size);
        }
        readopts.set_iterate_upper_bound(upper);
        readopts
    }
}

/// One raw row of the primary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl PrimaryRecord {
    pub fn locus(&self) -> Result<Locus, anyhow::Error> {
        Locus::from_key(&self.key)
    }

    /// Coordinates and alleles of the record, without payload.
    pub fn variant(&self) -> Result<Variant, anyhow::Error> {
        Variant::from_key(&self.key)
    }

    pub fn stored(&self) -> Result<StoredRecord, anyhow::Error> {
        serde_json::from_slice(&self.value).map_err(|e| {
            anyhow::anyhow!("could not decode value of row key {:?}: {}", &self.key, e)
        })
    }
}

/// A unit of parallel scanning: one chromosome with its sorted, disjoint ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub chrom: String,
    pub ranges: Vec<(u32, u32)>,
}

impl Partition {
    /// Build partitions from the requested regions, merging overlapping ranges.
    ///
    /// All ranges of a chromosome end up in the same partition.
    pub fn from_regions(regions: &[Region]) -> Vec<Self> {
        let mut regions = regions.to_vec();
        regions.sort();

        let mut result: Vec<Partition> = Vec::new();
        for region in regions {
            match result.last_mut() {
                Some(partition) if partition.chrom == region.chrom => {
                    let last = partition.ranges.last_mut().expect("never empty");
                    if region.start <= last.1.saturating_add(1) {
                        last.1 = last.1.max(region.end);
                    } else {
                        partition.ranges.push((region.start, region.end));
                    }
                }
                _ => result.push(Partition {
                    chrom: region.chrom.clone(),
                    ranges: vec![(region.start, region.end)],
                }),
            }
        }
        result
    }

    pub fn whole_chromosome(chrom: &str) -> Self {
        Self {
            chrom: chrom.to_string(),
            ranges: vec![(0, u32::MAX)],
        }
    }

    pub fn regions(&self) -> impl Iterator<Item = Region> + '_ {
        self.ranges
            .iter()
            .map(|(start, end)| Region::new(&self.chrom, *start, *end))
    }
}

/// Handle to the primary variant store.
#[derive(Clone)]
pub struct PrimaryStore {
    db: Arc<Db>,
}

impl std::fmt::Debug for PrimaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl PrimaryStore {
    /// Open or create the store at `path`, including all existing column families.
    pub fn open<P>(path: P) -> Result<Self, anyhow::Error>
    where
        P: AsRef<std::path::Path>,
    {
        let path = path.as_ref();
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let mut cf_names = Db::list_cf(&options, path).unwrap_or_default();
        for name in [CF_META, CF_VARIANTS] {
            if !cf_names.iter().any(|n| n == name) {
                cf_names.push(name.to_string());
            }
        }

        tracing::debug!("opening RocksDB {:?} with column families {:?}", path, &cf_names);
        let db = Db::open_cf(&options, path, &cf_names)
            .map_err(|e| anyhow::anyhow!("could not open RocksDB {:?}: {}", path, e))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn metadata(&self) -> Result<StoreMetadata, anyhow::Error> {
        let cf_meta = self.cf(CF_META)?;
        let annotation_id = self
            .db
            .get_cf(&cf_meta, META_ANNOTATION_ID)
            .map_err(|e| anyhow::anyhow!("problem reading metadata: {}", e))?
            .map(|raw| {
                String::from_utf8(raw)
                    .map_err(|e| anyhow::anyhow!("invalid {} in metadata: {}", META_ANNOTATION_ID, e))
            })
            .transpose()?;
        Ok(StoreMetadata { annotation_id })
    }

    pub fn put_meta(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        let cf_meta = self.cf(CF_META)?;
        self.db
            .put_cf(&cf_meta, key, value)
            .map_err(|e| anyhow::anyhow!("problem writing metadata {}: {}", key, e))
    }

    pub fn set_annotation_id(&self, annotation_id: &str) -> Result<(), anyhow::Error> {
        self.put_meta(META_ANNOTATION_ID, annotation_id)
    }

    /// Write one variant record.
    pub fn put(&self, variant: &Variant, record: &StoredRecord) -> Result<(), anyhow::Error> {
        let cf_variants = self.cf(CF_VARIANTS)?;
        let value = serde_json::to_vec(record)?;
        self.db
            .put_cf(&cf_variants, variant.to_key(), value)
            .map_err(|e| anyhow::anyhow!("problem writing variant {}: {}", variant, e))
    }

    pub fn delete(&self, variant: &Variant) -> Result<(), anyhow::Error> {
        let cf_variants = self.cf(CF_VARIANTS)?;
        self.db
            .delete_cf(&cf_variants, variant.to_key())
            .map_err(|e| anyhow::anyhow!("problem deleting variant {}: {}", variant, e))
    }

    /// Distinct chromosomes in key order, found with one seek per chromosome.
    pub fn chromosomes(&self) -> Result<Vec<String>, anyhow::Error> {
        let cf_variants = self.cf(CF_VARIANTS)?;
        let mut iter = self.db.raw_iterator_cf(&cf_variants);
        let mut result = Vec::new();

        iter.seek_to_first();
        while let Some(key) = iter.key() {
            let chrom = Locus::from_key(key)?.chrom;
            iter.seek(chrom_upper_bound(&chrom));
            result.push(chrom);
        }
        iter.status()
            .map_err(|e| anyhow::anyhow!("problem listing chromosomes: {}", e))?;

        Ok(result)
    }

    /// Partitions for scanning `regions`, or the whole store if none are given.
    pub fn partitions(&self, regions: &[Region]) -> Result<Vec<Partition>, anyhow::Error> {
        if regions.is_empty() {
            Ok(self
                .chromosomes()?
                .iter()
                .map(|chrom| Partition::whole_chromosome(chrom))
                .collect())
        } else {
            Ok(Partition::from_regions(regions))
        }
    }

    /// Scan all records of `partition` in key order, passing chunks of at most
    /// `chunk_size` records to `func`.
    pub fn scan_partition<F>(
        &self,
        partition: &Partition,
        options: &ScanOptions,
        chunk_size: usize,
        mut func: F,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(Vec<PrimaryRecord>) -> Result<(), anyhow::Error>,
    {
        let chunk_size = chunk_size.max(1);
        let cf_variants = self.cf(CF_VARIANTS)?;
        for region in partition.regions() {
            let (lower, upper) = region.key_range();
            let mut iter = self
                .db
                .raw_iterator_cf_opt(&cf_variants, options.read_options(upper));
            iter.seek(&lower);

            let mut chunk = Vec::with_capacity(chunk_size);
            while let (Some(key), Some(value)) = (iter.key(), iter.value()) {
                chunk.push(PrimaryRecord {
                    key: key.to_vec(),
                    value: value.to_vec(),
                });
                if chunk.len() >= chunk_size {
                    func(std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size)))?;
                }
                iter.next();
            }
            iter.status()
                .map_err(|e| anyhow::anyhow!("problem scanning region {}: {}", &region, e))?;
            if !chunk.is_empty() {
                func(chunk)?;
            }
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>, anyhow::Error> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow::anyhow!("unknown column family: {}", name))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Open a primary store in `dir` filled with `(chrom, pos, annotation_id)` records.
    pub(crate) fn store_with(
        dir: &std::path::Path,
        records: &[(&str, u32, Option<&str>)],
    ) -> Result<PrimaryStore, anyhow::Error> {
        let store = PrimaryStore::open(dir.join("primary"))?;
        for (chrom, pos, annotation_id) in records {
            store.put(
                &Variant::new(chrom, *pos, "A", "G"),
                &StoredRecord {
                    annotation_id: annotation_id.map(|s| s.to_string()),
                    annotation: None,
                },
            )?;
        }
        Ok(store)
    }

    fn scan_all(
        store: &PrimaryStore,
        partition: &Partition,
        chunk_size: usize,
    ) -> Result<Vec<Locus>, anyhow::Error> {
        let mut result = Vec::new();
        store.scan_partition(partition, &ScanOptions::default(), chunk_size, |chunk| {
            assert!(chunk.len() <= chunk_size);
            for record in chunk {
                result.push(record.locus()?);
            }
            Ok(())
        })?;
        Ok(result)
    }

    #[test]
    fn chromosomes_by_seek() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let store = store_with(
            &tmp_dir,
            &[("2", 10, None), ("1", 5, None), ("10", 1, None), ("1", 7, None)],
        )?;

        assert_eq!(store.chromosomes()?, vec!["1", "10", "2"]);

        Ok(())
    }

    #[test]
    fn scan_partition_respects_ranges() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let store = store_with(
            &tmp_dir,
            &[
                ("1", 5, None),
                ("1", 100, None),
                ("1", 150, None),
                ("1", 300, None),
                ("10", 120, None),
            ],
        )?;

        let partition = Partition {
            chrom: "1".into(),
            ranges: vec![(100, 200), (300, 300)],
        };
        assert_eq!(
            scan_all(&store, &partition, 1)?,
            vec![
                Locus::new("1", 100),
                Locus::new("1", 150),
                Locus::new("1", 300)
            ]
        );
        assert_eq!(
            scan_all(&store, &Partition::whole_chromosome("1"), 3)?.len(),
            4
        );

        Ok(())
    }

    #[test]
    fn partitions_merge_regions_per_chromosome() {
        let regions = vec![
            Region::new("2", 10, 20),
            Region::new("1", 500, 600),
            Region::new("1", 100, 200),
            Region::new("1", 150, 300),
            Region::new("1", 301, 310),
        ];

        assert_eq!(
            Partition::from_regions(&regions),
            vec![
                Partition {
                    chrom: "1".into(),
                    ranges: vec![(100, 310), (500, 600)],
                },
                Partition {
                    chrom: "2".into(),
                    ranges: vec![(10, 20)],
                },
            ]
        );
    }

    #[test]
    fn metadata_roundtrip() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let store = store_with(&tmp_dir, &[])?;
        assert_eq!(store.metadata()?, StoreMetadata::default());

        store.set_annotation_id("v2")?;
        assert_eq!(store.metadata()?.annotation_id.as_deref(), Some("v2"));

        Ok(())
    }

    #[test]
    fn malformed_value_is_error_with_key() {
        let record = PrimaryRecord {
            key: Variant::new("1", 1, "A", "C").to_key(),
            value: b"not json".to_vec(),
        };
        assert!(record.stored().is_err());
        assert_eq!(record.variant().unwrap(), Variant::new("1", 1, "A", "C"));
    }
}
