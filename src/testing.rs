//! In-memory remote server shared by the FTP and SFTP backend tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::ftp::FtpSession;
use crate::handle::EntryMetadata;
use crate::listing::RemoteEntry;
use crate::path::FsPath;
use crate::sftp::{RemoteFileId, SftpSession};

#[derive(Default)]
struct RemoteState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    open_files: HashMap<u64, String>,
    next_file: u64,
    list_calls: usize,
    quit_calls: usize,
    store_delay: Option<Duration>,
}

/// Cloning yields another session on the same server.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().expect("remote state lock")
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state();
        let mut current = FsPath::root();
        for segment in FsPath::new(path).segments() {
            current.add_path(segment).expect("segment");
            state.dirs.insert(current.to_string());
        }
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        let target = FsPath::new(path);
        self.add_dir(target.parent_path().as_str());
        self.state()
            .files
            .insert(target.to_string(), content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Deletes a file without going through any handle.
    pub fn drop_file(&self, path: &str) {
        self.state().files.remove(path);
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn quit_calls(&self) -> usize {
        self.state().quit_calls
    }

    pub fn open_file_count(&self) -> usize {
        self.state().open_files.len()
    }

    /// Makes every upload sleep before it lands on the server.
    pub fn slow_stores(&self, delay: Duration) {
        self.state().store_delay = Some(delay);
    }

    fn entries(&self, dir: &str) -> io::Result<Vec<RemoteEntry>> {
        let mut state = self.state();
        state.list_calls += 1;
        if !state.dirs.contains(dir) {
            return Err(missing(dir));
        }

        let mut entries = vec![dot_entry("."), dot_entry("..")];
        for child in state.dirs.iter().filter(|child| is_child_of(child, dir)) {
            entries.push(RemoteEntry {
                name: FsPath::new(child).name().to_string(),
                is_dir: true,
                size: 0,
                modified: None,
            });
        }
        for (child, content) in state.files.iter().filter(|(child, _)| is_child_of(child, dir)) {
            entries.push(RemoteEntry {
                name: FsPath::new(child).name().to_string(),
                is_dir: false,
                size: content.len() as u64,
                modified: None,
            });
        }
        Ok(entries)
    }

    fn require_parent(state: &RemoteState, path: &str) -> io::Result<()> {
        let parent = FsPath::new(path).parent_path();
        if state.dirs.contains(parent.as_str()) {
            Ok(())
        } else {
            Err(missing(parent.as_str()))
        }
    }

    fn remove_file_at(&self, path: &str) -> io::Result<()> {
        self.state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| missing(path))
    }

    fn remove_dir_at(&self, path: &str) -> io::Result<()> {
        let mut state = self.state();
        if !state.dirs.contains(path) {
            return Err(missing(path));
        }
        let occupied = state.dirs.iter().any(|dir| is_child_of(dir, path))
            || state.files.keys().any(|file| is_child_of(file, path));
        if occupied {
            return Err(io::Error::other(format!("directory not empty: {path}")));
        }
        state.dirs.remove(path);
        Ok(())
    }

    fn make_dir_at(&self, path: &str) -> io::Result<()> {
        let mut state = self.state();
        Self::require_parent(&state, path)?;
        if state.dirs.contains(path) || state.files.contains_key(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, path.to_string()));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }
}

fn is_child_of(candidate: &str, dir: &str) -> bool {
    candidate != "/" && FsPath::new(candidate).parent_path() == dir
}

fn dot_entry(name: &str) -> RemoteEntry {
    RemoteEntry {
        name: name.to_string(),
        is_dir: true,
        size: 0,
        modified: None,
    }
}

fn missing(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such path: {path}"))
}

impl FtpSession for MemoryRemote {
    fn list_details(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>> {
        self.entries(dir)
    }

    fn retrieve(&mut self, path: &str, sink: &mut dyn Write) -> io::Result<u64> {
        let content = self.file(path).ok_or_else(|| missing(path))?;
        sink.write_all(content.as_slice())?;
        Ok(content.len() as u64)
    }

    fn store(&mut self, path: &str, source: &mut dyn Read) -> io::Result<u64> {
        Self::require_parent(&self.state(), path)?;
        let mut content = Vec::new();
        source.read_to_end(&mut content)?;
        let delay = self.state().store_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let size = content.len() as u64;
        self.state().files.insert(path.to_string(), content);
        Ok(size)
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        self.remove_file_at(path)
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        self.remove_dir_at(path)
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        self.make_dir_at(path)
    }

    fn quit(&mut self) -> io::Result<()> {
        self.state().quit_calls += 1;
        Ok(())
    }
}

impl SftpSession for MemoryRemote {
    fn stat(&mut self, path: &str) -> io::Result<Option<EntryMetadata>> {
        let state = self.state();
        if state.dirs.contains(path) {
            return Ok(Some(EntryMetadata {
                is_dir: true,
                size: 0,
                modified: None,
            }));
        }
        Ok(state.files.get(path).map(|content| EntryMetadata {
            is_dir: false,
            size: content.len() as u64,
            modified: None,
        }))
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<RemoteEntry>> {
        self.entries(dir)
    }

    fn open_read(&mut self, path: &str) -> io::Result<RemoteFileId> {
        let mut state = self.state();
        if !state.files.contains_key(path) {
            return Err(missing(path));
        }
        state.next_file += 1;
        let id = state.next_file;
        state.open_files.insert(id, path.to_string());
        Ok(RemoteFileId(id))
    }

    fn create_truncate(&mut self, path: &str) -> io::Result<RemoteFileId> {
        let mut state = self.state();
        Self::require_parent(&state, path)?;
        state.files.insert(path.to_string(), Vec::new());
        state.next_file += 1;
        let id = state.next_file;
        state.open_files.insert(id, path.to_string());
        Ok(RemoteFileId(id))
    }

    fn read_at(&mut self, file: RemoteFileId, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state();
        let path = state
            .open_files
            .get(&file.0)
            .ok_or_else(|| io::Error::other("file not open"))?;
        let content = state.files.get(path).ok_or_else(|| missing(path))?;
        let start = (offset as usize).min(content.len());
        let count = (content.len() - start).min(buf.len());
        buf[..count].copy_from_slice(&content[start..start + count]);
        Ok(count)
    }

    fn write_at(&mut self, file: RemoteFileId, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        let path = state
            .open_files
            .get(&file.0)
            .cloned()
            .ok_or_else(|| io::Error::other("file not open"))?;
        let content = state.files.entry(path).or_default();
        let start = offset as usize;
        if content.len() < start + buf.len() {
            content.resize(start + buf.len(), 0);
        }
        content[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn close_file(&mut self, file: RemoteFileId) -> io::Result<()> {
        self.state()
            .open_files
            .remove(&file.0)
            .map(|_| ())
            .ok_or_else(|| io::Error::other("file not open"))
    }

    fn remove_file(&mut self, path: &str) -> io::Result<()> {
        self.remove_file_at(path)
    }

    fn remove_dir(&mut self, path: &str) -> io::Result<()> {
        self.remove_dir_at(path)
    }

    fn make_dir(&mut self, path: &str) -> io::Result<()> {
        self.make_dir_at(path)
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.state().quit_calls += 1;
        Ok(())
    }
}
