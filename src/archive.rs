use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use zip::ZipArchive;

use crate::bridge::spawn_download;
use crate::errors::{FsError, FsResult};
use crate::handle::{EntryMetadata, FileHandle, FileReader, FileWriter, copy_stream};
use crate::path::FsPath;
use crate::tree::{EntryTree, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

/// Read access to a zip-like container.
pub trait ArchiveSource: Send + Sync {
    /// Display name of the container, usually its file path.
    fn name(&self) -> &str;

    /// Entries in container order.
    fn entries(&self) -> &[ArchiveEntry];

    /// Streams one entry. Each stream decompresses independently of the others.
    fn open_entry(&self, name: &str) -> io::Result<FileReader>;
}

/// Archive file on disk. A clone reopens the file on first use so clones never
/// share a read position.
pub struct ArchiveFile {
    path: Arc<PathBuf>,
    file: Option<BufReader<File>>,
    position: u64,
}

impl ArchiveFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = BufReader::new(File::open(path)?);
        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            file: Some(file),
            position: 0,
        })
    }

    fn file(&mut self) -> io::Result<&mut BufReader<File>> {
        if self.file.is_none() {
            let mut file = BufReader::new(File::open(self.path.as_path())?);
            file.seek(SeekFrom::Start(self.position))?;
            return Ok(self.file.insert(file));
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("archive file not open"))
    }
}

impl Clone for ArchiveFile {
    fn clone(&self) -> Self {
        Self {
            path: Arc::clone(&self.path),
            file: None,
            position: self.position,
        }
    }
}

impl Read for ArchiveFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.file()?.read(buf)?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for ArchiveFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.file()?.seek(pos)?;
        Ok(self.position)
    }
}

pub struct ZipSource<R: Read + Seek> {
    name: String,
    archive: ZipArchive<R>,
    entries: Vec<ArchiveEntry>,
}

impl ZipSource<ArchiveFile> {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::new(path.display().to_string(), ArchiveFile::open(path)?)
    }
}

impl<R: Read + Seek> ZipSource<R> {
    pub fn new(name: String, reader: R) -> io::Result<Self> {
        let mut archive = ZipArchive::new(reader).map_err(zip_to_io)?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index).map_err(zip_to_io)?;
            entries.push(ArchiveEntry {
                name: entry.name().to_string(),
                size: entry.size(),
            });
        }
        debug!(archive = name.as_str(), entries = entries.len(), "archive opened");
        Ok(Self {
            name,
            archive,
            entries,
        })
    }
}

impl<R> ArchiveSource for ZipSource<R>
where
    R: Read + Seek + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn entries(&self) -> &[ArchiveEntry] {
        self.entries.as_slice()
    }

    fn open_entry(&self, name: &str) -> io::Result<FileReader> {
        let index = self.archive.index_for_name(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no entry named {name}"))
        })?;
        // The clone shares the parsed central directory and reads through its own reader.
        let mut archive = self.archive.clone();
        let label = format!("{}!/{name}", self.name);
        Ok(Box::new(spawn_download(label, move |sink| {
            let mut entry = archive.by_index(index).map_err(zip_to_io)?;
            copy_stream(&mut entry, sink)
        })))
    }
}

fn zip_to_io(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(err) => err,
        zip::result::ZipError::FileNotFound => io::Error::new(io::ErrorKind::NotFound, err),
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Read-only handle over the entries of an archive.
///
/// The entry tree and the container are shared between all handles created by
/// iteration; each handle owns its path and the node it resolves to.
pub struct ArchiveHandle {
    source: Arc<dyn ArchiveSource>,
    tree: Arc<EntryTree>,
    label: String,
    path: FsPath,
    node: Option<NodeId>,
}

impl ArchiveHandle {
    pub fn new(source: Box<dyn ArchiveSource>) -> Self {
        Self::with_path(source, "/")
    }

    pub fn with_path(source: Box<dyn ArchiveSource>, path: &str) -> Self {
        let tree = EntryTree::build(source.entries().iter().map(|entry| entry.name.as_str()));
        let label = source.name().to_string();
        let path = FsPath::new(path);
        let node = tree.lookup(path.as_str());
        Self {
            source: Arc::from(source),
            tree: Arc::new(tree),
            label,
            path,
            node,
        }
    }

    pub fn open(archive: &Path, path: &str) -> FsResult<Self> {
        let source = ZipSource::open(archive)
            .map_err(|err| FsError::from_io("open_archive", archive.display().to_string(), err))?;
        Ok(Self::with_path(Box::new(source), path))
    }

    fn sibling(&self, path: FsPath) -> Self {
        let node = self.tree.lookup(path.as_str());
        Self {
            source: Arc::clone(&self.source),
            tree: Arc::clone(&self.tree),
            label: self.label.clone(),
            path,
            node,
        }
    }

    fn entry(&self, node: NodeId) -> Option<&ArchiveEntry> {
        self.tree
            .entry(node)
            .and_then(|index| self.source.entries().get(index))
    }

    /// Explicit directory entries end with `/`; implied ones have no entry.
    fn is_dir_node(&self, node: NodeId) -> bool {
        node == EntryTree::ROOT
            || self.tree.is_directory(node)
            || self
                .entry(node)
                .is_none_or(|entry| entry.name.ends_with('/'))
    }

    fn cant_write(&self, operation: &'static str) -> FsError {
        FsError::unsupported(operation, format!("{} (read-only archive)", self.label))
    }
}

impl fmt::Display for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZIP ({}) {}", self.label, self.path)
    }
}

impl FileHandle for ArchiveHandle {
    fn path(&self) -> &FsPath {
        &self.path
    }

    fn path_mut(&mut self) -> &mut FsPath {
        &mut self.path
    }

    fn path_changed(&mut self) {
        self.node = self.tree.lookup(self.path.as_str());
    }

    fn base(&self) -> String {
        self.label.clone()
    }

    fn exists(&mut self) -> FsResult<bool> {
        Ok(self.node.is_some())
    }

    fn is_directory(&mut self) -> FsResult<bool> {
        Ok(self.node.is_some_and(|node| self.is_dir_node(node)))
    }

    fn metadata(&mut self) -> FsResult<Option<EntryMetadata>> {
        Ok(self.node.map(|node| {
            let size = self.entry(node).map(|entry| entry.size).unwrap_or(0);
            let is_dir = self.is_dir_node(node);
            EntryMetadata {
                is_dir,
                size: if is_dir { 0 } else { size },
                modified: None,
            }
        }))
    }

    fn list(&mut self) -> FsResult<Option<Vec<String>>> {
        let Some(node) = self.node.filter(|node| self.is_dir_node(*node)) else {
            return Ok(None);
        };
        Ok(Some(
            self.tree
                .children(node)
                .map(|child| self.tree.name(child).to_string())
                .collect(),
        ))
    }

    fn open_read(&mut self) -> FsResult<FileReader> {
        let Some(node) = self.node else {
            return Err(FsError::not_found("read", self.path.as_str()));
        };
        let entry = match self.entry(node) {
            Some(entry) if !self.is_dir_node(node) => entry,
            _ => return Err(FsError::is_a_directory("read", self.path.as_str())),
        };
        self.source
            .open_entry(entry.name.as_str())
            .map_err(|err| FsError::from_io("read", self.path.as_str(), err))
    }

    fn open_write(&mut self) -> FsResult<FileWriter> {
        Err(self.cant_write("write"))
    }

    fn put_bytes(&mut self, _bytes: &[u8]) -> FsResult<()> {
        Err(self.cant_write("write"))
    }

    fn copy_from(&mut self, _source: &mut dyn Read) -> FsResult<u64> {
        Err(self.cant_write("copy"))
    }

    fn delete(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn delete_recursive(&mut self) -> FsResult<()> {
        Ok(())
    }

    fn mkdirs(&mut self) -> FsResult<bool> {
        Ok(self.node.is_some())
    }

    fn detach_child(&self, name: &str) -> Option<Box<dyn FileHandle>> {
        Some(Box::new(self.sibling(FsPath::new(&self.path.child(name)))))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Cursor, Read, Write};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::{ArchiveHandle, ZipSource};
    use crate::errors::FsError;
    use crate::handle::FileHandle;

    fn build_zip(files: &[(&str, &str)], dirs: &[&str]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for dir in dirs {
            writer.add_directory(*dir, options).expect("add dir");
        }
        for (name, content) in files {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(content.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn temp_dir_path(name: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("valid time")
            .as_nanos();
        std::env::temp_dir().join(format!("polyfs_archive_test_{timestamp}_{name}"))
    }

    fn handle_for(files: &[(&str, &str)], dirs: &[&str]) -> ArchiveHandle {
        let bytes = build_zip(files, dirs);
        let source = ZipSource::new("test.zip".to_string(), Cursor::new(bytes)).expect("zip");
        ArchiveHandle::new(Box::new(source))
    }

    #[test]
    fn lists_children_in_archive_order() {
        let mut handle = handle_for(&[("a/b.txt", "bee"), ("a/c/d.txt", "dee")], &[]);
        handle.set_path("/a");
        assert!(handle.is_directory().expect("is_directory"));
        assert_eq!(
            handle.list().expect("list"),
            Some(vec!["b.txt".to_string(), "c".to_string()])
        );
        handle.add_path("c/d.txt").expect("relative");
        assert_eq!(handle.get_bytes().expect("read"), b"dee");
        assert_eq!(handle.list().expect("list"), None);
    }

    #[test]
    fn root_always_exists_and_is_directory() {
        let mut handle = handle_for(&[], &[]);
        assert!(handle.exists().expect("exists"));
        assert!(handle.is_directory().expect("is_directory"));
        assert_eq!(handle.list().expect("list"), Some(Vec::new()));
    }

    #[test]
    fn missing_path_fails_with_not_found() {
        let mut handle = handle_for(&[("a.txt", "A")], &[]);
        handle.set_path("/b.txt");
        assert!(!handle.exists().expect("exists"));
        let err = handle.get_bytes().unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
    }

    #[test]
    fn reading_directory_fails_with_is_a_directory() {
        let mut handle = handle_for(&[("docs/readme.md", "# hi")], &["empty/"]);
        handle.set_path("/docs");
        assert!(matches!(
            handle.get_bytes().unwrap_err(),
            FsError::IsADirectory { .. }
        ));
        handle.set_path("/empty");
        assert!(handle.exists().expect("exists"));
        assert!(handle.is_directory().expect("is_directory"));
        assert_eq!(handle.list().expect("list"), Some(Vec::new()));
        assert!(matches!(
            handle.get_bytes().unwrap_err(),
            FsError::IsADirectory { .. }
        ));
    }

    #[test]
    fn writes_are_rejected_and_deletes_are_no_ops() {
        let mut handle = handle_for(&[("a.txt", "A")], &[]);
        handle.set_path("/a.txt");
        assert!(matches!(
            handle.put_bytes(b"new").unwrap_err(),
            FsError::Unsupported { .. }
        ));
        assert!(matches!(
            handle.open_write().err().expect("write rejected"),
            FsError::Unsupported { .. }
        ));
        handle.delete().expect("no-op");
        handle.delete_recursive().expect("no-op");
        assert!(handle.mkdirs().expect("no-op"));
        assert_eq!(handle.get_bytes().expect("still readable"), b"A");

        handle.set_path("/new/dir");
        assert!(!handle.mkdirs().expect("no-op"));
        assert!(!handle.exists().expect("exists"));
    }

    #[test]
    fn iteration_hands_out_independent_handles() {
        let handle = handle_for(&[("d/one", "1"), ("d/two", "2")], &[]);
        let mut dir: Box<dyn FileHandle> = Box::new(handle);
        dir.set_path("/d");

        let mut collected = Vec::new();
        {
            let mut children = dir.iterate().expect("iterate");
            while let Some(child) = children.next_child() {
                let mut child = child.expect("child");
                collected.push((
                    child.path().to_string(),
                    child.get_bytes().expect("read child"),
                ));
            }
        }
        assert_eq!(
            collected,
            vec![
                ("/d/one".to_string(), b"1".to_vec()),
                ("/d/two".to_string(), b"2".to_vec())
            ]
        );
        assert_eq!(dir.path().as_str(), "/d");
    }

    #[test]
    fn filtered_iteration_skips_rejected_names() {
        let handle = handle_for(&[("x.rs", "fn"), ("y.md", "#")], &[]);
        let mut dir: Box<dyn FileHandle> = Box::new(handle);
        let mut children = dir
            .iterate_filtered(&|name| name.ends_with(".md"))
            .expect("iterate");
        assert_eq!(children.remaining(), 1);
        let child = children.next_child().expect("one child").expect("ok");
        assert_eq!(child.name(), "y.md");
    }

    #[test]
    fn metadata_reports_entry_size() {
        let blob = "0123456789012345678901234567890123456789AB";
        let mut handle = handle_for(&[("blob.bin", blob)], &[]);
        handle.set_path("/blob.bin");
        let metadata = handle.metadata().expect("metadata").expect("present");
        assert!(!metadata.is_dir);
        assert_eq!(metadata.size, 42);
    }

    #[test]
    fn entry_streams_from_disk_read_independently() {
        let root = temp_dir_path("streams");
        fs::create_dir_all(&root).expect("create root");
        let archive = root.join("data.zip");
        let big: String = (0..50_000u32).map(|n| char::from(b'a' + (n % 26) as u8)).collect();
        fs::write(&archive, build_zip(&[("big.txt", big.as_str()), ("small.txt", "tiny")], &[]))
            .expect("write archive");

        let mut handle = ArchiveHandle::open(&archive, "/big.txt").expect("open");
        let mut big_reader = handle.open_read().expect("open big");
        let mut head = [0u8; 26];
        big_reader.read_exact(&mut head).expect("read head");
        assert_eq!(&head, b"abcdefghijklmnopqrstuvwxyz");

        handle.set_path("/small.txt");
        assert_eq!(handle.get_bytes().expect("small while big is open"), b"tiny");

        let mut rest = Vec::new();
        big_reader.read_to_end(&mut rest).expect("read rest");
        assert_eq!(head.len() + rest.len(), big.len());
        assert_eq!(&rest[..], &big.as_bytes()[26..]);
        big_reader.close().expect("close");

        let _ = fs::remove_dir_all(root);
    }
}
