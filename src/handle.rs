use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::time::SystemTime;

use crate::errors::{FsError, FsResult};
use crate::path::FsPath;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Readable content of one file. Dropping the stream releases it; `close`
/// does the same but reports failures.
pub trait ReadStream: Read + Send {
    fn close(self: Box<Self>) -> FsResult<()> {
        Ok(())
    }
}

/// Writable content of one file. The data is only guaranteed to be stored
/// once `close` has returned.
pub trait WriteStream: Write + Send {
    fn close(self: Box<Self>) -> FsResult<()>;
}

pub type FileReader = Box<dyn ReadStream>;
pub type FileWriter = Box<dyn WriteStream>;

/// Uniform file operations over one backend, applied to a current path.
///
/// A handle is a cursor: navigation mutates the path in place. Backends that
/// own a connection keep it until `close`.
pub trait FileHandle: Send + fmt::Display {
    fn path(&self) -> &FsPath;

    fn path_mut(&mut self) -> &mut FsPath;

    /// Called after every path mutation.
    fn path_changed(&mut self) {}

    /// Location prefix of the backend, e.g. `ftp://user@host`.
    fn base(&self) -> String;

    fn exists(&mut self) -> FsResult<bool>;

    fn is_directory(&mut self) -> FsResult<bool>;

    fn metadata(&mut self) -> FsResult<Option<EntryMetadata>>;

    /// Child names in backend order, `None` when the path is not a directory.
    fn list(&mut self) -> FsResult<Option<Vec<String>>>;

    fn list_filtered(&mut self, filter: &dyn Fn(&str) -> bool) -> FsResult<Option<Vec<String>>> {
        Ok(self
            .list()?
            .map(|names| names.into_iter().filter(|name| filter(name.as_str())).collect()))
    }

    fn open_read(&mut self) -> FsResult<FileReader>;

    fn open_write(&mut self) -> FsResult<FileWriter>;

    fn get_bytes(&mut self) -> FsResult<Vec<u8>> {
        let mut reader = self.open_read()?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|err| FsError::remote("read", self.path().as_str(), err))?;
        reader.close()?;
        Ok(bytes)
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> FsResult<()> {
        let mut writer = self.open_write()?;
        writer
            .write_all(bytes)
            .map_err(|err| FsError::remote("write", self.path().as_str(), err))?;
        writer.close()
    }

    /// Streams `source` into the current path, returning the byte count.
    fn copy_from(&mut self, source: &mut dyn Read) -> FsResult<u64> {
        let mut writer = self.open_write()?;
        let copied = copy_stream(source, &mut writer)
            .map_err(|err| FsError::remote("copy", self.path().as_str(), err))?;
        writer.close()?;
        Ok(copied)
    }

    /// Removes a file or an empty directory. Root and missing paths are no-ops.
    fn delete(&mut self) -> FsResult<()>;

    /// Removes a directory bottom-up; the first failure aborts the rest.
    fn delete_recursive(&mut self) -> FsResult<()>;

    /// Creates every missing segment and reports whether the path exists afterwards.
    fn mkdirs(&mut self) -> FsResult<bool>;

    fn close(&mut self) -> FsResult<()> {
        Ok(())
    }

    /// Independent handle positioned at `name` below the current path, for
    /// backends that hand out one handle per child while iterating.
    fn detach_child(&self, _name: &str) -> Option<Box<dyn FileHandle>> {
        None
    }

    fn name(&self) -> &str {
        self.path().name()
    }

    fn parent_path(&self) -> String {
        self.path().parent_path()
    }

    fn set_path(&mut self, raw: &str) {
        self.path_mut().set_path(raw);
        self.path_changed();
    }

    fn set_name(&mut self, name: &str) -> FsResult<()> {
        self.path_mut().set_name(name)?;
        self.path_changed();
        Ok(())
    }

    fn add_path(&mut self, relative: &str) -> FsResult<()> {
        self.path_mut().add_path(relative)?;
        self.path_changed();
        Ok(())
    }

    fn parent(&mut self) {
        self.path_mut().parent();
        self.path_changed();
    }
}

impl dyn FileHandle {
    pub fn iterate(&mut self) -> FsResult<Children<'_>> {
        let names = self.list()?.unwrap_or_default();
        Ok(Children::new(self, names))
    }

    pub fn iterate_filtered(&mut self, filter: &dyn Fn(&str) -> bool) -> FsResult<Children<'_>> {
        let names = self.list_filtered(filter)?.unwrap_or_default();
        Ok(Children::new(self, names))
    }
}

/// Single-pass walk over the children of a directory handle.
///
/// Cursor backends move the parent handle itself onto each child; when the
/// walk ends or is dropped, the handle returns to the directory.
pub struct Children<'a> {
    handle: &'a mut (dyn FileHandle + 'static),
    names: std::vec::IntoIter<String>,
    positioned: bool,
}

impl<'a> Children<'a> {
    fn new(handle: &'a mut (dyn FileHandle + 'static), names: Vec<String>) -> Self {
        Self {
            handle,
            names: names.into_iter(),
            positioned: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.names.len()
    }

    pub fn next_child(&mut self) -> Option<FsResult<ChildHandle<'_>>> {
        let Some(name) = self.names.next() else {
            self.restore();
            return None;
        };

        if let Some(detached) = self.handle.detach_child(name.as_str()) {
            return Some(Ok(ChildHandle::Detached(detached)));
        }

        let step = if self.positioned {
            self.handle.set_name(name.as_str())
        } else {
            self.handle.add_path(name.as_str())
        };
        if let Err(err) = step {
            return Some(Err(err));
        }
        self.positioned = true;
        Some(Ok(ChildHandle::Cursor(&mut *self.handle)))
    }

    fn restore(&mut self) {
        if self.positioned {
            self.handle.parent();
            self.positioned = false;
        }
    }
}

impl Drop for Children<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

pub enum ChildHandle<'a> {
    Cursor(&'a mut (dyn FileHandle + 'static)),
    Detached(Box<dyn FileHandle>),
}

impl Deref for ChildHandle<'_> {
    type Target = dyn FileHandle;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Cursor(handle) => &**handle,
            Self::Detached(handle) => handle.as_ref(),
        }
    }
}

impl DerefMut for ChildHandle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Cursor(handle) => &mut **handle,
            Self::Detached(handle) => handle.as_mut(),
        }
    }
}

pub(crate) fn copy_stream(source: &mut dyn Read, sink: &mut dyn Write) -> io::Result<u64> {
    let mut buffer = vec![0_u8; COPY_BUFFER_SIZE];
    let mut total = 0_u64;
    loop {
        let read = match source.read(buffer.as_mut_slice()) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        sink.write_all(&buffer[..read])?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}
