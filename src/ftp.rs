use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, warn};

use crate::bridge::{spawn_download, spawn_upload};
use crate::config::FtpConnectionInfo;
use crate::errors::{FsError, FsResult};
use crate::handle::{EntryMetadata, FileHandle, FileReader, FileWriter, copy_stream};
use crate::listing::{ListingCache, RemoteEntry, find_entry};
use crate::path::FsPath;

/// The FTP operations the backend needs. Paths are absolute.
pub trait FtpSession: Send {
    fn list_details(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>>;

    /// Blocks until the whole file has been written to `sink`.
    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> io::Result<u64>;

    /// Blocks until `source` is exhausted and the server has stored the file.
    fn store(&mut self, path: &str, source: &mut dyn Read) -> io::Result<u64>;

    fn remove_file(&mut self, path: &str) -> io::Result<()>;

    fn remove_dir(&mut self, path: &str) -> io::Result<()>;

    fn make_dir(&mut self, path: &str) -> io::Result<()>;

    fn quit(&mut self) -> io::Result<()>;
}

/// `FtpSession` over a suppaftp control connection in binary mode.
pub struct SuppaFtpSession {
    stream: FtpStream,
    cwd: Option<String>,
}

impl SuppaFtpSession {
    pub fn connect(info: &FtpConnectionInfo) -> io::Result<Self> {
        let address = format!("{}:{}", info.host, info.port);
        let mut stream = FtpStream::connect(address.as_str()).map_err(ftp_to_io)?;
        stream
            .login(info.user.as_str(), info.password.as_str())
            .map_err(ftp_to_io)?;
        stream.transfer_type(FileType::Binary).map_err(ftp_to_io)?;
        debug!(host = info.host.as_str(), user = info.user.as_str(), "ftp session ready");
        Ok(Self { stream, cwd: None })
    }

    fn enter(&mut self, dir: &str) -> io::Result<()> {
        if self.cwd.as_deref() == Some(dir) {
            return Ok(());
        }
        self.stream.cwd(dir).map_err(ftp_to_io)?;
        self.cwd = Some(dir.to_string());
        Ok(())
    }

    /// Changes into the parent of `path` and returns the final segment.
    fn enter_parent(&mut self, path: &str) -> io::Result<String> {
        let target = FsPath::new(path);
        self.enter(target.parent_path().as_str())?;
        Ok(target.name().to_string())
    }
}

impl FtpSession for SuppaFtpSession {
    fn list_details(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>> {
        let lines = self.stream.list(Some(dir)).map_err(ftp_to_io)?;
        let mut entries = Vec::with_capacity(lines.len());
        for line in lines {
            match suppaftp::list::File::from_str(line.as_str()) {
                Ok(file) => entries.push(RemoteEntry {
                    name: file.name().to_string(),
                    is_dir: file.is_directory(),
                    size: if file.is_directory() { 0 } else { file.size() as u64 },
                    modified: Some(file.modified()),
                }),
                Err(err) => debug!(dir, line = line.as_str(), "skipping unparsable listing line: {err}"),
            }
        }
        Ok(entries)
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> io::Result<u64> {
        let name = self.enter_parent(path)?;
        self.stream
            .retr(name.as_str(), |reader| {
                copy_stream(reader, sink).map_err(FtpError::ConnectionError)
            })
            .map_err(ftp_to_io)
    }

    fn store(&mut self, path: &str, mut source: &mut dyn Read) -> io::Result<u64> {
        let name = self.enter_parent(path)?;
        self.stream
            .put_file(name.as_str(), &mut source)
            .map_err(ftp_to_io)
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        let name = self.enter_parent(path)?;
        self.stream.rm(name.as_str()).map_err(ftp_to_io)
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        let name = self.enter_parent(path)?;
        self.stream.rmdir(name.as_str()).map_err(ftp_to_io)
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        let name = self.enter_parent(path)?;
        self.stream.mkdir(name.as_str()).map_err(ftp_to_io)
    }

    fn quit(&mut self) -> io::Result<()> {
        self.cwd = None;
        self.stream.quit().map_err(ftp_to_io)
    }
}

fn ftp_to_io(err: FtpError) -> io::Error {
    match err {
        FtpError::ConnectionError(err) => err,
        other => io::Error::other(other.to_string()),
    }
}

type SharedSession = Arc<Mutex<Box<dyn FtpSession>>>;

/// Handle over an FTP server.
///
/// Existence and metadata are answered from cached parent listings. Streams
/// run the transfer on a worker thread that holds the session, so the handle
/// must not be used again until the stream is closed.
pub struct FtpHandle {
    session: SharedSession,
    listings: ListingCache,
    base: String,
    path: FsPath,
    closed: bool,
}

impl FtpHandle {
    pub fn connect(info: &FtpConnectionInfo) -> FsResult<Self> {
        let base = format!("ftp://{}@{}", info.user, info.host);
        let session = SuppaFtpSession::connect(info)
            .map_err(|err| FsError::remote("connect", base.as_str(), err))?;
        Ok(Self::with_session(Box::new(session), base, info.path.as_str()))
    }

    pub fn with_session(session: Box<dyn FtpSession>, base: String, path: &str) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            listings: ListingCache::new(),
            base,
            path: FsPath::new(path),
            closed: false,
        }
    }

    fn call<T>(
        &self,
        operation: &'static str,
        path: &str,
        remote_call: impl FnOnce(&mut dyn FtpSession) -> io::Result<T>,
    ) -> FsResult<T> {
        let mut session = lock_session(&self.session)
            .map_err(|err| FsError::remote(operation, path, err))?;
        remote_call(&mut **session).map_err(|err| FsError::remote(operation, path, err))
    }

    fn entries(&mut self, operation: &'static str, dir: &str) -> FsResult<Vec<RemoteEntry>> {
        fetch_listing(&mut self.listings, &self.session, operation, dir).map(<[_]>::to_vec)
    }

    /// Resolves the current path one cached listing per level.
    fn lookup(&mut self, operation: &'static str) -> FsResult<Option<RemoteEntry>> {
        let path = self.path.clone();
        self.lookup_at(&path, operation)
    }

    fn lookup_at(
        &mut self,
        path: &FsPath,
        operation: &'static str,
    ) -> FsResult<Option<RemoteEntry>> {
        let segments: Vec<&str> = path.segments().collect();
        let mut dir = FsPath::root();
        let mut found = None;
        for (index, segment) in segments.iter().enumerate() {
            let entries = fetch_listing(&mut self.listings, &self.session, operation, dir.as_str())?;
            let Some(entry) = find_entry(entries, segment) else {
                return Ok(None);
            };
            if !entry.is_dir && index + 1 < segments.len() {
                return Ok(None);
            }
            found = Some(entry.clone());
            dir.add_path(segment)?;
        }
        Ok(found)
    }

    fn require_file(&mut self, operation: &'static str) -> FsResult<()> {
        match self.lookup(operation)? {
            Some(entry) if !entry.is_dir => Ok(()),
            None if !self.path.is_root() => Err(FsError::not_found(operation, self.path.as_str())),
            _ => Err(FsError::is_a_directory(operation, self.path.as_str())),
        }
    }

    /// A write target must not be a directory and its parent must not be a file.
    fn require_writable(&mut self, operation: &'static str) -> FsResult<()> {
        if self.is_directory()? {
            return Err(FsError::is_a_directory(operation, self.path.as_str()));
        }
        let parent = FsPath::new(&self.path.parent_path());
        if parent.is_root() {
            return Ok(());
        }
        match self.lookup_at(&parent, operation)? {
            Some(entry) if !entry.is_dir => {
                Err(FsError::not_a_directory(operation, parent.as_str()))
            }
            _ => Ok(()),
        }
    }

    fn remove_tree(&mut self, dir: &str) -> FsResult<()> {
        let dir_path = FsPath::new(dir);
        for entry in self.entries("delete", dir)? {
            let child = dir_path.child(entry.name.as_str());
            if entry.is_dir {
                self.remove_tree(child.as_str())?;
            } else {
                self.call("delete", child.as_str(), |session| {
                    session.remove_file(child.as_str())
                })?;
            }
            // Evict per child so a later failure leaves no removed names cached.
            self.listings.evict(dir);
        }
        self.listings.evict(dir);
        self.call("delete", dir, |session| session.remove_dir(dir))?;
        self.listings.evict_parent_of(&dir_path);
        Ok(())
    }
}

fn lock_session(session: &SharedSession) -> io::Result<MutexGuard<'_, Box<dyn FtpSession>>> {
    session
        .lock()
        .map_err(|_| io::Error::other("ftp session poisoned"))
}

/// The session is only locked on a cache miss.
fn fetch_listing<'c>(
    listings: &'c mut ListingCache,
    session: &SharedSession,
    operation: &'static str,
    dir: &str,
) -> FsResult<&'c [RemoteEntry]> {
    listings
        .get_or_fetch(dir, |dir| lock_session(session)?.list_details(dir))
        .map_err(|err| FsError::remote(operation, dir, err))
}

impl fmt::Display for FtpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.path)
    }
}

impl FileHandle for FtpHandle {
    fn path(&self) -> &FsPath {
        &self.path
    }

    fn path_mut(&mut self) -> &mut FsPath {
        &mut self.path
    }

    fn base(&self) -> String {
        self.base.clone()
    }

    fn exists(&mut self) -> FsResult<bool> {
        if self.path.is_root() {
            return Ok(true);
        }
        Ok(self.lookup("exists")?.is_some())
    }

    fn is_directory(&mut self) -> FsResult<bool> {
        if self.path.is_root() {
            return Ok(true);
        }
        Ok(self.lookup("is_directory")?.is_some_and(|entry| entry.is_dir))
    }

    fn metadata(&mut self) -> FsResult<Option<EntryMetadata>> {
        if self.path.is_root() {
            return Ok(Some(EntryMetadata {
                is_dir: true,
                size: 0,
                modified: None,
            }));
        }
        Ok(self.lookup("metadata")?.map(|entry| entry.metadata()))
    }

    fn list(&mut self) -> FsResult<Option<Vec<String>>> {
        if !self.is_directory()? {
            return Ok(None);
        }
        let dir = self.path.to_string();
        let entries = fetch_listing(&mut self.listings, &self.session, "list", dir.as_str())?;
        Ok(Some(entries.iter().map(|entry| entry.name.clone()).collect()))
    }

    fn open_read(&mut self) -> FsResult<FileReader> {
        self.require_file("read")?;

        let session = Arc::clone(&self.session);
        let path = self.path.to_string();
        let label = format!("{}{}", self.base, path);
        Ok(Box::new(spawn_download(label, move |sink| {
            lock_session(&session)?.retrieve(path.as_str(), sink)
        })))
    }

    fn open_write(&mut self) -> FsResult<FileWriter> {
        self.require_writable("write")?;
        self.listings.evict_parent_of(&self.path);

        let session = Arc::clone(&self.session);
        let path = self.path.to_string();
        let label = format!("{}{}", self.base, path);
        Ok(Box::new(spawn_upload(label, move |source| {
            lock_session(&session)?.store(path.as_str(), source)
        })))
    }

    fn get_bytes(&mut self) -> FsResult<Vec<u8>> {
        self.require_file("read")?;
        let path = self.path.to_string();
        let mut bytes = Vec::new();
        self.call("read", path.as_str(), |session| {
            session.retrieve(path.as_str(), &mut bytes)
        })?;
        Ok(bytes)
    }

    fn put_bytes(&mut self, bytes: &[u8]) -> FsResult<()> {
        self.require_writable("write")?;
        let path = self.path.to_string();
        self.call("write", path.as_str(), |session| {
            session.store(path.as_str(), &mut io::Cursor::new(bytes))
        })?;
        self.listings.evict_parent_of(&self.path);
        Ok(())
    }

    fn delete(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        let Some(entry) = self.lookup("delete")? else {
            return Ok(());
        };
        let path = self.path.to_string();
        if entry.is_dir {
            self.call("delete", path.as_str(), |session| {
                session.remove_dir(path.as_str())
            })?;
            self.listings.evict(path.as_str());
        } else {
            self.call("delete", path.as_str(), |session| {
                session.remove_file(path.as_str())
            })?;
        }
        self.listings.evict_parent_of(&self.path);
        Ok(())
    }

    fn delete_recursive(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        match self.lookup("delete")? {
            Some(entry) if entry.is_dir => {
                let path = self.path.to_string();
                self.remove_tree(path.as_str())
            }
            _ => self.delete(),
        }
    }

    fn mkdirs(&mut self) -> FsResult<bool> {
        let segments: Vec<String> = self.path.segments().map(str::to_string).collect();
        let mut dir = FsPath::root();
        for segment in &segments {
            let entries = fetch_listing(&mut self.listings, &self.session, "mkdirs", dir.as_str())?;
            match find_entry(entries, segment) {
                Some(entry) if entry.is_dir => {}
                Some(_) => return Ok(false),
                None => {
                    let created = dir.child(segment);
                    self.call("mkdirs", created.as_str(), |session| {
                        session.make_dir(created.as_str())
                    })?;
                    self.listings.evict(dir.as_str());
                }
            }
            dir.add_path(segment)?;
        }
        Ok(true)
    }

    fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.listings.clear();
        self.call("close", self.base.as_str(), |session| session.quit())?;
        debug!(base = self.base.as_str(), "ftp session closed");
        Ok(())
    }
}

impl Drop for FtpHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(base = self.base.as_str(), "ftp session did not close cleanly: {err}");
        }
    }
}
