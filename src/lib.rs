pub mod archive;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod factory;
pub mod ftp;
pub mod handle;
pub mod listing;
pub mod local;
pub mod path;
pub mod resource;
pub mod sftp;
pub mod tree;

#[cfg(test)]
mod testing;

pub use config::BackendSpec;
pub use errors::{FsError, FsResult};
pub use factory::{open_backend, open_descriptor, open_resource, open_url};
pub use handle::{ChildHandle, Children, EntryMetadata, FileHandle, FileReader, FileWriter};
pub use path::FsPath;
