use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, UNIX_EPOCH};

use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, warn};

use crate::config::{SftpAuth, SftpConnectionInfo};
use crate::errors::{FsError, FsResult};
use crate::handle::{EntryMetadata, FileHandle, FileReader, FileWriter, ReadStream, WriteStream};
use crate::listing::{ListingCache, RemoteEntry};
use crate::path::FsPath;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const FILE_MODE: i32 = 0o644;
const DIR_MODE: i32 = 0o755;
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side open file, valid until `close_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteFileId(pub u64);

/// The SFTP operations the backend needs. Paths are absolute.
pub trait SftpSession: Send {
    /// `None` when nothing exists at `path`.
    fn stat(&mut self, path: &str) -> io::Result<Option<EntryMetadata>>;

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>>;

    fn open_read(&mut self, path: &str) -> io::Result<RemoteFileId>;

    fn create_truncate(&mut self, path: &str) -> io::Result<RemoteFileId>;

    fn read_at(&mut self, file: RemoteFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn write_at(&mut self, file: RemoteFileId, offset: u64, buf: &[u8]) -> io::Result<usize>;

    fn close_file(&mut self, file: RemoteFileId) -> io::Result<()>;

    fn remove_file(&mut self, path: &str) -> io::Result<()>;

    fn remove_dir(&mut self, path: &str) -> io::Result<()>;

    fn make_dir(&mut self, path: &str) -> io::Result<()>;

    fn disconnect(&mut self) -> io::Result<()>;
}

/// `SftpSession` over an ssh2 session.
pub struct Ssh2Session {
    session: Session,
    sftp: Sftp,
    files: HashMap<u64, ssh2::File>,
    next_file: u64,
}

impl Ssh2Session {
    pub fn connect(info: &SftpConnectionInfo) -> io::Result<Self> {
        let endpoint = format!("{}:{}", info.host, info.port);
        let tcp = TcpStream::connect(endpoint.as_str())?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        match &info.auth {
            SftpAuth::Agent => session.userauth_agent(info.user.as_str())?,
            SftpAuth::Password(password) => {
                session.userauth_password(info.user.as_str(), password.as_str())?
            }
            SftpAuth::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                info.user.as_str(),
                None,
                path.as_path(),
                passphrase.as_deref(),
            )?,
        }

        if !session.authenticated() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("sftp auth failed for {}", info.user),
            ));
        }
        let sftp = session.sftp()?;
        debug!(host = info.host.as_str(), user = info.user.as_str(), "sftp session ready");
        Ok(Self {
            session,
            sftp,
            files: HashMap::new(),
            next_file: 0,
        })
    }

    fn register(&mut self, file: ssh2::File) -> RemoteFileId {
        self.next_file += 1;
        self.files.insert(self.next_file, file);
        RemoteFileId(self.next_file)
    }

    fn file(&mut self, file: RemoteFileId) -> io::Result<&mut ssh2::File> {
        self.files
            .get_mut(&file.0)
            .ok_or_else(|| io::Error::other(format!("remote file {} is not open", file.0)))
    }
}

impl SftpSession for Ssh2Session {
    fn stat(&mut self, path: &str) -> io::Result<Option<EntryMetadata>> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(metadata_from_stat(&stat))),
            Err(err) if err.code() == ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for (entry_path, stat) in self.sftp.readdir(Path::new(dir))? {
            let Some(name) = entry_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
            else {
                continue;
            };
            let metadata = metadata_from_stat(&stat);
            entries.push(RemoteEntry {
                name,
                is_dir: metadata.is_dir,
                size: metadata.size,
                modified: metadata.modified,
            });
        }
        Ok(entries)
    }

    fn open_read(&mut self, path: &str) -> io::Result<RemoteFileId> {
        let file = self.sftp.open(Path::new(path))?;
        Ok(self.register(file))
    }

    fn create_truncate(&mut self, path: &str) -> io::Result<RemoteFileId> {
        let file = self.sftp.open_mode(
            Path::new(path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            FILE_MODE,
            OpenType::File,
        )?;
        Ok(self.register(file))
    }

    fn read_at(&mut self, file: RemoteFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file(file)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn write_at(&mut self, file: RemoteFileId, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let file = self.file(file)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write(buf)
    }

    fn close_file(&mut self, file: RemoteFileId) -> io::Result<()> {
        match self.files.remove(&file.0) {
            Some(mut file) => file.close().map_err(io::Error::from),
            None => Ok(()),
        }
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        self.sftp.unlink(Path::new(path)).map_err(io::Error::from)
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        self.sftp.rmdir(Path::new(path)).map_err(io::Error::from)
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        self.sftp.mkdir(Path::new(path), DIR_MODE).map_err(io::Error::from)
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.files.clear();
        self.session
            .disconnect(None, "closing", None)
            .map_err(io::Error::from)
    }
}

fn metadata_from_stat(stat: &FileStat) -> EntryMetadata {
    let is_dir = stat.perm.unwrap_or(0) & S_IFMT == S_IFDIR;
    EntryMetadata {
        is_dir,
        size: if is_dir { 0 } else { stat.size.unwrap_or(0) },
        modified: stat
            .mtime
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
    }
}

type SharedSession = Arc<Mutex<Box<dyn SftpSession>>>;

fn lock_session(session: &SharedSession) -> io::Result<MutexGuard<'_, Box<dyn SftpSession>>> {
    session
        .lock()
        .map_err(|_| io::Error::other("sftp session poisoned"))
}

/// Handle over an SFTP server. Existence comes from one stat per call;
/// directory listings are cached until a mutation evicts them.
pub struct SftpHandle {
    session: SharedSession,
    listings: ListingCache,
    base: String,
    path: FsPath,
    closed: bool,
}

impl SftpHandle {
    pub fn connect(info: &SftpConnectionInfo) -> FsResult<Self> {
        let base = format!("ssh://{}@{}", info.user, info.host);
        let session = Ssh2Session::connect(info)
            .map_err(|err| FsError::remote("connect", base.as_str(), err))?;
        Ok(Self::with_session(Box::new(session), base, info.path.as_str()))
    }

    pub fn with_session(session: Box<dyn SftpSession>, base: String, path: &str) -> Self {
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
        remote_call: impl FnOnce(&mut dyn SftpSession) -> io::Result<T>,
    ) -> FsResult<T> {
        let mut session = lock_session(&self.session)
            .map_err(|err| FsError::remote(operation, path, err))?;
        remote_call(&mut **session).map_err(|err| FsError::remote(operation, path, err))
    }

    fn stat_at(&self, operation: &'static str, path: &str) -> FsResult<Option<EntryMetadata>> {
        if path == "/" {
            return Ok(Some(EntryMetadata {
                is_dir: true,
                size: 0,
                modified: None,
            }));
        }
        self.call(operation, path, |session| session.stat(path))
    }

    fn entries(&mut self, operation: &'static str, dir: &str) -> FsResult<Vec<RemoteEntry>> {
        let session = &self.session;
        self.listings
            .get_or_fetch(dir, |dir| lock_session(session)?.read_dir(dir))
            .map(<[_]>::to_vec)
            .map_err(|err| FsError::remote(operation, dir, err))
    }

    fn open_file(&self, operation: &'static str, id: RemoteFileId) -> SftpFile {
        debug!(target_path = self.path.as_str(), operation, "remote file opened");
        SftpFile {
            session: Arc::clone(&self.session),
            id: Some(id),
            offset: 0,
            label: format!("{}{}", self.base, self.path),
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

impl fmt::Display for SftpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.path)
    }
}

impl FileHandle for SftpHandle {
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
        Ok(self.stat_at("exists", self.path.as_str())?.is_some())
    }

    fn is_directory(&mut self) -> FsResult<bool> {
        Ok(self
            .stat_at("is_directory", self.path.as_str())?
            .is_some_and(|metadata| metadata.is_dir))
    }

    fn metadata(&mut self) -> FsResult<Option<EntryMetadata>> {
        self.stat_at("metadata", self.path.as_str())
    }

    fn list(&mut self) -> FsResult<Option<Vec<String>>> {
        if !self.is_directory()? {
            return Ok(None);
        }
        let dir = self.path.to_string();
        let entries = self.entries("list", dir.as_str())?;
        Ok(Some(entries.into_iter().map(|entry| entry.name).collect()))
    }

    fn open_read(&mut self) -> FsResult<FileReader> {
        let path = self.path.to_string();
        match self.stat_at("read", path.as_str())? {
            None => return Err(FsError::not_found("read", path)),
            Some(metadata) if metadata.is_dir => {
                return Err(FsError::is_a_directory("read", path));
            }
            Some(_) => {}
        }
        let id = self.call("read", path.as_str(), |session| session.open_read(path.as_str()))?;
        Ok(Box::new(self.open_file("read", id)))
    }

    fn open_write(&mut self) -> FsResult<FileWriter> {
        let path = self.path.to_string();
        if self.is_directory()? {
            return Err(FsError::is_a_directory("write", path));
        }
        let parent = self.path.parent_path();
        if self
            .stat_at("write", parent.as_str())?
            .is_some_and(|metadata| !metadata.is_dir)
        {
            return Err(FsError::not_a_directory("write", parent));
        }
        let id = self.call("write", path.as_str(), |session| {
            session.create_truncate(path.as_str())
        })?;
        self.listings.evict_parent_of(&self.path);
        Ok(Box::new(self.open_file("write", id)))
    }

    fn delete(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        let path = self.path.to_string();
        let Some(metadata) = self.stat_at("delete", path.as_str())? else {
            return Ok(());
        };
        if metadata.is_dir {
            self.call("delete", path.as_str(), |session| session.remove_dir(path.as_str()))?;
            self.listings.evict(path.as_str());
        } else {
            self.call("delete", path.as_str(), |session| session.remove_file(path.as_str()))?;
        }
        self.listings.evict_parent_of(&self.path);
        Ok(())
    }

    fn delete_recursive(&mut self) -> FsResult<()> {
        if self.path.is_root() {
            return Ok(());
        }
        if self.is_directory()? {
            let path = self.path.to_string();
            self.remove_tree(path.as_str())
        } else {
            self.delete()
        }
    }

    fn mkdirs(&mut self) -> FsResult<bool> {
        let mut dir = FsPath::root();
        for segment in self.path.clone().segments() {
            let level = dir.child(segment);
            match self.stat_at("mkdirs", level.as_str())? {
                Some(metadata) if metadata.is_dir => {}
                Some(_) => return Ok(false),
                None => {
                    self.call("mkdirs", level.as_str(), |session| {
                        session.make_dir(level.as_str())
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
        self.call("close", self.base.as_str(), |session| session.disconnect())?;
        debug!(base = self.base.as_str(), "sftp session closed");
        Ok(())
    }
}

impl Drop for SftpHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(base = self.base.as_str(), "sftp session did not close cleanly: {err}");
        }
    }
}

/// Stream over one open remote file; each call is one offset-addressed
/// request.
struct SftpFile {
    session: SharedSession,
    id: Option<RemoteFileId>,
    offset: u64,
    label: String,
}

impl SftpFile {
    fn open_id(&self) -> io::Result<RemoteFileId> {
        self.id
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"))
    }

    fn release(&mut self) -> FsResult<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        lock_session(&self.session)
            .and_then(|mut session| session.close_file(id))
            .map_err(|err| FsError::remote("close", self.label.as_str(), err))
    }
}

impl Read for SftpFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let id = self.open_id()?;
        let count = lock_session(&self.session)?.read_at(id, self.offset, buf)?;
        self.offset += count as u64;
        Ok(count)
    }
}

impl Write for SftpFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let id = self.open_id()?;
        let count = lock_session(&self.session)?.write_at(id, self.offset, buf)?;
        self.offset += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReadStream for SftpFile {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        self.release()
    }
}

impl WriteStream for SftpFile {
    fn close(mut self: Box<Self>) -> FsResult<()> {
        self.release()
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(target_path = self.label.as_str(), "remote file not released: {err}");
        }
    }
}
