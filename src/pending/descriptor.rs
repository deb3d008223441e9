//! Policies deciding which variants are pending and where they are stored.

use crate::err::PendingError;
use crate::primary::{PrimaryRecord, ScanOptions, StoreMetadata};

use super::Evaluation;

/// Default shard window size in positions.
pub const DEFAULT_WINDOW_SIZE: u32 = 1_000_000;
/// Suffix of shard files.
pub const SHARD_SUFFIX: &str = ".json.gz";

/// Policy for one kind of pending work.
///
/// Implementations are stateless and are called concurrently from all scan
/// partitions.  `evaluate` must only depend on the record and the metadata.
pub trait PendingDescriptor: Send + Sync {
    /// Stable name, used as table name and shard file name prefix.
    fn name(&self) -> &str;

    /// Tune a scan of the primary store.
    fn configure_scan(&self, _scan: &mut ScanOptions, _metadata: &StoreMetadata) {}

    fn evaluate(&self, record: &PrimaryRecord, metadata: &StoreMetadata) -> Evaluation;
}

/// Write to apply to a table-backed pending store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMutation {
    /// Insert or replace the pending row.
    Put { key: Vec<u8> },
    /// Remove the pending row, with `if_present` only when it currently exists.
    Delete { key: Vec<u8>, if_present: bool },
}

/// Descriptors for a pending set held in a RocksDB column family.
pub trait TablePendingDescriptor: PendingDescriptor {
    /// Default name of the column family, always prefixed by `name()`.
    fn table_name(&self) -> String {
        format!("{}_pending", self.name())
    }

    fn build_mutation(&self, record: &PrimaryRecord, evaluation: Evaluation) -> TableMutation {
        let key = record.key.clone();
        match evaluation {
            Evaluation::Pending => TableMutation::Put { key },
            Evaluation::Ready => TableMutation::Delete {
                key,
                if_present: true,
            },
            Evaluation::NoLongerPending => TableMutation::Delete {
                key,
                if_present: false,
            },
        }
    }
}

/// Descriptors for a pending set held in windowed shard files.
pub trait FilePendingDescriptor: PendingDescriptor {
    fn window_size(&self) -> u32 {
        DEFAULT_WINDOW_SIZE
    }

    /// Shard file name for the variants at `chrom:pos`.
    fn shard_name(&self, chrom: &str, pos: u32) -> String {
        shard_file_name(self.name(), chrom, window_start(pos, self.window_size()))
    }

    /// Decode `(chromosome, window start)` from a shard file name.
    fn parse_shard_name(&self, file_name: &str) -> Option<(String, u32)> {
        parse_shard_file_name(self.name(), file_name)
    }

    fn is_shard_file(&self, file_name: &str) -> bool {
        self.parse_shard_name(file_name).is_some()
    }
}

/// Start of the window containing `pos`.
pub fn window_start(pos: u32, window_size: u32) -> u32 {
    (pos / window_size) * window_size
}

/// Build `NAME.CHROM.POS10.json.gz`.
pub fn shard_file_name(name: &str, chrom: &str, window_start: u32) -> String {
    format!(
        "{}.{}.{:010}{}",
        name,
        url_encode(chrom),
        window_start,
        SHARD_SUFFIX
    )
}

/// Inverse of `shard_file_name`, `None` for anything not following the convention.
pub fn parse_shard_file_name(name: &str, file_name: &str) -> Option<(String, u32)> {
    let rest = file_name
        .strip_prefix(name)?
        .strip_prefix('.')?
        .strip_suffix(SHARD_SUFFIX)?;
    let (chrom, pos) = rest.rsplit_once('.')?;
    if chrom.is_empty() || pos.len() != 10 || !pos.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((url_decode(chrom)?, pos.parse().ok()?))
}

/// Encode following `application/x-www-form-urlencoded` rules.
pub fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'*' | b'_' => {
                result.push(b as char)
            }
            b' ' => result.push('+'),
            _ => result.push_str(&format!("%{:02X}", b)),
        }
    }
    result
}

pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => result.push(b' '),
            b'%' => {
                let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
                result.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => result.push(b),
        }
        i += 1;
    }
    String::from_utf8(result).ok()
}

/// Variants are pending until annotated by the current annotation run.
#[derive(Debug, Clone, Default)]
pub struct AnnotationPendingDescriptor;

impl AnnotationPendingDescriptor {
    pub const NAME: &'static str = "annotation";

    /// Scan read-ahead for full store scans.
    const READAHEAD_SIZE: usize = 4 * 1024 * 1024;
}

impl PendingDescriptor for AnnotationPendingDescriptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure_scan(&self, scan: &mut ScanOptions, _metadata: &StoreMetadata) {
        // one-off sequential pass, keep the block cache for point lookups
        scan.fill_cache = false;
        scan.readahead_size = Self::READAHEAD_SIZE;
    }

    fn evaluate(&self, record: &PrimaryRecord, metadata: &StoreMetadata) -> Evaluation {
        if let Ok(variant) = record.variant() {
            if variant.alternative == "*" || variant.alternative.starts_with('<') {
                return Evaluation::NoLongerPending;
            }
        }

        let stored = match record.stored() {
            Ok(stored) => stored,
            Err(e) => {
                tracing::trace!("treating undecodable record as pending: {}", e);
                return Evaluation::Pending;
            }
        };
        match (&stored.annotation_id, &metadata.annotation_id) {
            (Some(annotated), Some(current)) if annotated == current => Evaluation::Ready,
            (Some(_), None) => Evaluation::Ready,
            _ => Evaluation::Pending,
        }
    }
}

impl TablePendingDescriptor for AnnotationPendingDescriptor {}

/// `AnnotationPendingDescriptor` with pending variants sharded into position windows.
#[derive(Debug, Clone)]
pub struct WindowedAnnotationPendingDescriptor {
    inner: AnnotationPendingDescriptor,
    window_size: u32,
}

impl WindowedAnnotationPendingDescriptor {
    pub fn new(window_size: u32) -> Result<Self, PendingError> {
        if window_size == 0 {
            return Err(PendingError::InvalidWindowSize(window_size));
        }
        Ok(Self {
            inner: AnnotationPendingDescriptor,
            window_size,
        })
    }
}

impl Default for WindowedAnnotationPendingDescriptor {
    fn default() -> Self {
        Self {
            inner: AnnotationPendingDescriptor,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl PendingDescriptor for WindowedAnnotationPendingDescriptor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure_scan(&self, scan: &mut ScanOptions, metadata: &StoreMetadata) {
        self.inner.configure_scan(scan, metadata)
    }

    fn evaluate(&self, record: &PrimaryRecord, metadata: &StoreMetadata) -> Evaluation {
        self.inner.evaluate(record, metadata)
    }
}

impl FilePendingDescriptor for WindowedAnnotationPendingDescriptor {
    fn window_size(&self) -> u32 {
        self.window_size
    }
}
