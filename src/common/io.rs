//! Common, IO-related code.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};

/// Transparently open a file with gzip decoder.
pub fn open_read_maybe_gz<P>(path: P) -> Result<Box<dyn BufRead>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let file = File::open(path.as_ref())
        .map_err(|e| anyhow::anyhow!("could not open {:?} for reading: {}", path.as_ref(), e))?;
    if is_gz(path.as_ref()) {
        tracing::trace!("Opening {:?} as gzip for reading", path.as_ref());
        Ok(gz_reader(Box::new(file)))
    } else {
        tracing::trace!("Opening {:?} as plain text for reading", path.as_ref());
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Transparently open a file with gzip encoder.
pub fn open_write_maybe_gz<P>(path: P) -> Result<Box<dyn Write>, anyhow::Error>
where
    P: AsRef<Path>,
{
    let file = File::create(path.as_ref())
        .map_err(|e| anyhow::anyhow!("could not open {:?} for writing: {}", path.as_ref(), e))?;
    if is_gz(path.as_ref()) {
        tracing::trace!("Opening {:?} as gzip for writing", path.as_ref());
        Ok(Box::new(gz_writer(Box::new(BufWriter::new(file)))))
    } else {
        tracing::trace!("Opening {:?} as plain text for writing", path.as_ref());
        Ok(Box::new(BufWriter::new(file)))
    }
}

/// Wrap a raw byte stream into a buffered gzip decoder.
pub fn gz_reader(inner: Box<dyn Read>) -> Box<dyn BufRead> {
    Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(inner))))
}

/// Wrap a raw byte sink into a gzip encoder.
pub fn gz_writer(inner: Box<dyn Write>) -> GzEncoder<Box<dyn Write>> {
    GzEncoder::new(inner, Compression::default())
}

fn is_gz(path: &Path) -> bool {
    path.extension().map(|s| s.to_str()) == Some(Some("gz"))
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, Write};

    use pretty_assertions::assert_eq;

    #[rstest::rstest]
    #[case("test.txt")]
    #[case("test.txt.gz")]
    fn write_then_read_maybe_gz(#[case] filename: &str) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();

        {
            let mut f = super::open_write_maybe_gz(tmp_dir.join(filename))?;
            writeln!(f, "first")?;
            writeln!(f, "second")?;
            f.flush()?;
        }

        let lines = super::open_read_maybe_gz(tmp_dir.join(filename))?
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);

        Ok(())
    }

    #[test]
    fn gz_file_starts_with_magic() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("magic.txt.gz");
        {
            let mut f = super::open_write_maybe_gz(&path)?;
            writeln!(f, "x")?;
        }

        let buf = std::fs::read(&path)?;
        assert_eq!(&buf[0..2], &[0x1f, 0x8b]);

        Ok(())
    }

    #[test]
    fn open_missing_file_names_path() {
        let err = super::open_read_maybe_gz("/nonexistent/pending.json.gz")
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("/nonexistent/pending.json.gz"));
    }
}
