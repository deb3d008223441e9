//! Minimal hierarchical filesystem abstraction used by the file-backed pending store.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
};

/// Listing entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
}

impl FileStatus {
    /// File name as UTF-8 string, empty if not representable.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }
}

/// Operations on a (possibly remote) filesystem.
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    /// List the direct children of `dir`.
    fn list(&self, dir: &Path) -> Result<Vec<FileStatus>, anyhow::Error>;
    /// Open the file at `path` as a raw byte stream.
    fn open(&self, path: &Path) -> Result<Box<dyn Read>, anyhow::Error>;
    /// Create or truncate the file at `path`.
    fn create(&self, path: &Path) -> Result<Box<dyn Write>, anyhow::Error>;
    /// Move `src` to `dst`, returns `false` if nothing was renamed.
    fn rename(&self, src: &Path, dst: &Path) -> Result<bool, anyhow::Error>;
    /// Delete `path`, returns `false` if it did not exist.
    fn delete(&self, path: &Path, recursive: bool) -> Result<bool, anyhow::Error>;
    fn exists(&self, path: &Path) -> Result<bool, anyhow::Error>;
    /// Create `dir` and all missing parents.
    fn mkdirs(&self, dir: &Path) -> Result<(), anyhow::Error>;
}

/// `FileSystem` on top of `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn list(&self, dir: &Path) -> Result<Vec<FileStatus>, anyhow::Error> {
        let mut result = Vec::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("could not list directory {:?}: {}", dir, e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| anyhow::anyhow!("could not list directory {:?}: {}", dir, e))?;
            let metadata = entry
                .metadata()
                .map_err(|e| anyhow::anyhow!("could not stat {:?}: {}", entry.path(), e))?;
            result.push(FileStatus {
                path: entry.path(),
                is_dir: metadata.is_dir(),
                len: metadata.len(),
            });
        }
        Ok(result)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read>, anyhow::Error> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("could not open {:?} for reading: {}", path, e))?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write>, anyhow::Error> {
        let file = File::create(path)
            .map_err(|e| anyhow::anyhow!("could not open {:?} for writing: {}", path, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<bool, anyhow::Error> {
        if !src.exists() {
            return Ok(false);
        }
        std::fs::rename(src, dst)
            .map_err(|e| anyhow::anyhow!("could not rename {:?} to {:?}: {}", src, dst, e))?;
        Ok(true)
    }

    fn delete(&self, path: &Path, recursive: bool) -> Result<bool, anyhow::Error> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => anyhow::bail!("could not stat {:?}: {}", path, e),
        };
        let res = if !metadata.is_dir() {
            std::fs::remove_file(path)
        } else if recursive {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_dir(path)
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::anyhow!("could not delete {:?}: {}", path, e)),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool, anyhow::Error> {
        path.try_exists()
            .map_err(|e| anyhow::anyhow!("could not check {:?}: {}", path, e))
    }

    fn mkdirs(&self, dir: &Path) -> Result<(), anyhow::Error> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("could not create directory {:?}: {}", dir, e))
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use pretty_assertions::assert_eq;

    use super::{FileSystem, LocalFileSystem};

    #[test]
    fn create_list_open() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let fs = LocalFileSystem;
        fs.mkdirs(&tmp_dir.join("sub"))?;
        {
            let mut f = fs.create(&tmp_dir.join("a.txt"))?;
            f.write_all(b"hello")?;
        }

        let mut listing = fs.list(&tmp_dir)?;
        listing.sort();
        let names = listing.iter().map(|s| s.file_name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(!listing[0].is_dir);
        assert!(listing[1].is_dir);

        let mut buf = String::new();
        fs.open(&tmp_dir.join("a.txt"))?.read_to_string(&mut buf)?;
        assert_eq!(buf, "hello");

        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let fs = LocalFileSystem;
        let path = tmp_dir.join("x");
        fs.create(&path)?;

        assert!(fs.delete(&path, false)?);
        assert!(!fs.delete(&path, false)?);
        assert!(!fs.exists(&path)?);

        Ok(())
    }

    #[test]
    fn delete_recursive() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let fs = LocalFileSystem;
        let dir = tmp_dir.join("a/b");
        fs.mkdirs(&dir)?;
        fs.create(&dir.join("f"))?;

        assert!(fs.delete(&dir, false).is_err());
        assert!(fs.delete(&tmp_dir.join("a"), true)?);
        assert!(!fs.exists(&tmp_dir.join("a"))?);

        Ok(())
    }

    #[test]
    fn rename_missing_source() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let fs = LocalFileSystem;
        fs.create(&tmp_dir.join("src"))?;

        assert!(fs.rename(&tmp_dir.join("src"), &tmp_dir.join("dst"))?);
        assert!(!fs.rename(&tmp_dir.join("src"), &tmp_dir.join("dst"))?);
        assert!(fs.exists(&tmp_dir.join("dst"))?);

        Ok(())
    }
}
