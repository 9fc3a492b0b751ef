use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use tracing::debug;
use walkdir::WalkDir;

use crate::errors::{FsError, FsResult};
use crate::handle::{EntryMetadata, FileHandle, FileReader, FileWriter, ReadStream, WriteStream};
use crate::path::FsPath;

/// Host filesystem handle. Nothing is cached and `close` does nothing.
#[derive(Debug, Clone, Default)]
pub struct LocalHandle {
    path: FsPath,
}

impl LocalHandle {
    pub fn new(path: &str) -> Self {
        Self {
            path: FsPath::new(path),
        }
    }

    fn host_path(&self) -> PathBuf {
        PathBuf::from(self.path.as_str())
    }

    /// A file standing in for an ancestor directory means the path is absent.
    fn host_metadata(&self, operation: &'static str) -> FsResult<Option<fs::Metadata>> {
        match fs::metadata(self.host_path()) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(FsError::from_io(operation, self.path.as_str(), err)),
        }
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl FileHandle for LocalHandle {
    fn path(&self) -> &FsPath {
        &self.path
    }

    fn path_mut(&mut self) -> &mut FsPath {
        &mut self.path
    }

    fn base(&self) -> String {
        self.path.to_string()
    }

    fn exists(&mut self) -> FsResult<bool> {
        Ok(self.host_metadata("exists")?.is_some())
    }

    fn is_directory(&mut self) -> FsResult<bool> {
        Ok(self
            .host_metadata("is_directory")?
            .is_some_and(|metadata| metadata.is_dir()))
    }

    fn metadata(&mut self) -> FsResult<Option<EntryMetadata>> {
        Ok(self
            .host_metadata("metadata")?
            .map(|metadata| EntryMetadata {
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified: metadata.modified().ok(),
            }))
    }

    fn list(&mut self) -> FsResult<Option<Vec<String>>> {
        if !self.is_directory()? {
            return Ok(None);
        }

        let dir_iter = fs::read_dir(self.host_path())
            .map_err(|err| FsError::from_io("list", self.path.as_str(), err))?;
        let mut names = Vec::new();
        for entry_result in dir_iter {
            let entry =
                entry_result.map_err(|err| FsError::from_io("list", self.path.as_str(), err))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(Some(names))
    }

    fn open_read(&mut self) -> FsResult<FileReader> {
        if self.is_directory()? {
            return Err(FsError::is_a_directory("read", self.path.as_str()));
        }
        let file = File::open(self.host_path())
            .map_err(|err| FsError::from_io("read", self.path.as_str(), err))?;
        Ok(Box::new(LocalReader { file }))
    }

    fn open_write(&mut self) -> FsResult<FileWriter> {
        if self.is_directory()? {
            return Err(FsError::is_a_directory("write", self.path.as_str()));
        }
        let file = File::create(self.host_path())
            .map_err(|err| FsError::from_io("write", self.path.as_str(), err))?;
        Ok(Box::new(LocalWriter {
            file,
            path: self.path.to_string(),
        }))
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> FsResult<()> {
        if self.is_directory()? {
            return Err(FsError::is_a_directory("write", self.path.as_str()));
        }
        fs::write(self.host_path(), bytes)
            .map_err(|err| FsError::from_io("write", self.path.as_str(), err))
    }

    fn delete(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        let host_path = self.host_path();
        let metadata = match fs::symlink_metadata(&host_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(FsError::from_io("delete", self.path.as_str(), err)),
        };

        let removed = if metadata.file_type().is_dir() {
            fs::remove_dir(&host_path)
        } else {
            fs::remove_file(&host_path)
        };
        removed.map_err(|err| FsError::remote("delete", self.path.as_str(), err))
    }

    fn delete_recursive(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        let host_path = self.host_path();
        let metadata = match fs::symlink_metadata(&host_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(FsError::from_io("delete", self.path.as_str(), err)),
        };
        if !metadata.file_type().is_dir() {
            return self.delete();
        }

        for entry in WalkDir::new(&host_path).follow_links(false).contents_first(true) {
            let entry = entry.map_err(|err| {
                let path = err
                    .path()
                    .unwrap_or(host_path.as_path())
                    .display()
                    .to_string();
                FsError::remote("delete", path, io::Error::other(err.to_string()))
            })?;
            let removed = if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
            } else {
                fs::remove_file(entry.path())
            };
            removed.map_err(|err| {
                FsError::remote("delete", entry.path().display().to_string(), err)
            })?;
        }
        Ok(())
    }

    fn mkdirs(&mut self) -> FsResult<bool> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        if let Err(err) = builder.create(self.host_path()) {
            debug!(target_path = self.path.as_str(), "mkdirs failed: {err}");
        }
        self.is_directory()
    }
}

struct LocalReader {
    file: File,
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ReadStream for LocalReader {}

struct LocalWriter {
    file: File,
    path: String,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WriteStream for LocalWriter {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        self.file
            .flush()
            .and_then(|_| self.file.sync_all())
            .map_err(|err| FsError::remote("write", self.path.as_str(), err))
    }
}
