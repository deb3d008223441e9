//! Shard file codec: gzip compressed JSON lines, one variant per line.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;

use crate::common::io::{gz_reader, gz_writer};
use crate::fs::FileSystem;
use crate::variant::Variant;

/// Streams variants into one shard file.
pub struct ShardWriter {
    path: PathBuf,
    encoder: GzEncoder<Box<dyn Write>>,
    count: usize,
}

impl ShardWriter {
    pub fn create(fs: &dyn FileSystem, path: &Path) -> Result<Self, anyhow::Error> {
        tracing::trace!("creating shard {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            encoder: gz_writer(fs.create(path)?),
            count: 0,
        })
    }

    pub fn write(&mut self, variant: &Variant) -> Result<(), anyhow::Error> {
        serde_json::to_writer(&mut self.encoder, variant)
            .map_err(|e| anyhow::anyhow!("problem writing {} to {:?}: {}", variant, &self.path, e))?;
        self.encoder
            .write_all(b"\n")
            .map_err(|e| anyhow::anyhow!("problem writing to {:?}: {}", &self.path, e))?;
        self.count += 1;
        Ok(())
    }

    /// Finish the gzip stream and flush, returning the number of variants written.
    pub fn finish(self) -> Result<usize, anyhow::Error> {
        let mut inner = self
            .encoder
            .finish()
            .map_err(|e| anyhow::anyhow!("problem finishing {:?}: {}", &self.path, e))?;
        inner
            .flush()
            .map_err(|e| anyhow::anyhow!("problem flushing {:?}: {}", &self.path, e))?;
        tracing::trace!("wrote {} variants to {:?}", self.count, &self.path);
        Ok(self.count)
    }
}

/// Streams variants out of one shard file.
pub struct ShardReader {
    path: PathBuf,
    lines: std::io::Lines<Box<dyn BufRead>>,
    lineno: usize,
}

impl ShardReader {
    /// Open the shard at `path`, failing right away on a broken gzip header.
    pub fn open(fs: &dyn FileSystem, path: &Path) -> Result<Self, anyhow::Error> {
        tracing::trace!("opening shard {:?}", path);
        let mut reader = gz_reader(fs.open(path)?);
        reader
            .fill_buf()
            .map_err(|e| anyhow::anyhow!("problem opening shard {:?}: {}", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: reader.lines(),
            lineno: 0,
        })
    }

    /// Next variant, `None` at the end of the file.
    pub fn next_variant(&mut self) -> Result<Option<Variant>, anyhow::Error> {
        for line in self.lines.by_ref() {
            self.lineno += 1;
            let line = line.map_err(|e| {
                anyhow::anyhow!("problem reading {:?} at line {}: {}", &self.path, self.lineno, e)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let variant = serde_json::from_str(&line).map_err(|e| {
                anyhow::anyhow!("problem decoding {:?} at line {}: {}", &self.path, self.lineno, e)
            })?;
            return Ok(Some(variant));
        }
        Ok(None)
    }
}

/// Read all variants of the shard at `path`.
pub fn read_shard(fs: &dyn FileSystem, path: &Path) -> Result<Vec<Variant>, anyhow::Error> {
    let mut reader = ShardReader::open(fs, path)?;
    let mut result = Vec::new();
    while let Some(variant) = reader.next_variant()? {
        result.push(variant);
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fs::LocalFileSystem;

    #[test]
    fn write_then_read_keeps_alleles_and_payload() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("annotation.1.0000000000.json.gz");
        let mut with_payload = Variant::new("1", 10, "ACGT", "A");
        with_payload.annotation = Some(serde_json::json!({"consequence": ["missense"]}));
        let variants = vec![with_payload, Variant::new("1", 20, "C", "<DUP>")];

        let mut writer = ShardWriter::create(&LocalFileSystem, &path)?;
        for variant in &variants {
            writer.write(variant)?;
        }
        assert_eq!(writer.finish()?, 2);

        let read = read_shard(&LocalFileSystem, &path)?;
        assert_eq!(read, variants);
        assert_eq!(read[0].annotation, variants[0].annotation);
        assert_eq!(read[1].annotation, None);

        Ok(())
    }

    #[test]
    fn empty_shard_reads_empty() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("empty.json.gz");
        ShardWriter::create(&LocalFileSystem, &path)?.finish()?;

        assert_eq!(read_shard(&LocalFileSystem, &path)?, vec![]);

        Ok(())
    }

    #[test]
    fn open_fails_on_corrupt_header() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("corrupt.json.gz");
        std::fs::write(&path, b"definitely not gzip")?;

        let err = ShardReader::open(&LocalFileSystem, &path)
            .err()
            .expect("open must fail");
        assert!(err.to_string().contains("corrupt.json.gz"));

        Ok(())
    }

    #[test]
    fn corrupt_shard_names_path() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("corrupt.json.gz");
        std::fs::write(&path, b"definitely not gzip")?;

        let err = read_shard(&LocalFileSystem, &path).unwrap_err();
        assert!(err.to_string().contains("corrupt.json.gz"));

        Ok(())
    }
}
