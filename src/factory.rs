use url::Url;

use crate::archive::ArchiveHandle;
use crate::config::{BackendSpec, decode};
use crate::errors::{FsError, FsResult};
use crate::ftp::FtpHandle;
use crate::handle::FileHandle;
use crate::local::LocalHandle;
use crate::resource::ResourceResolver;
use crate::sftp::SftpHandle;

/// Opens a handle for a `file:` or `jar:file:…!/…` URL. Other schemes are
/// unsupported here; remote servers go through [`open_backend`].
pub fn open_url(text: &str) -> FsResult<Box<dyn FileHandle>> {
    let url = Url::parse(text)
        .map_err(|err| FsError::invalid_argument("open_url", text, err.to_string()))?;
    open_backend(&resource_spec(&url, text)?)
}

/// Resolves `name` through `resolver` and opens whatever it points at.
pub fn open_resource(resolver: &dyn ResourceResolver, name: &str) -> FsResult<Box<dyn FileHandle>> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let url = resolver
        .resolve(name)
        .ok_or_else(|| FsError::not_found("open_resource", name))?;
    open_url(url.as_str())
}

pub fn open_backend(spec: &BackendSpec) -> FsResult<Box<dyn FileHandle>> {
    match spec {
        BackendSpec::Local { path } => Ok(Box::new(LocalHandle::new(path.as_str()))),
        BackendSpec::Archive { archive, member } => {
            Ok(Box::new(ArchiveHandle::open(archive.as_path(), member.as_str())?))
        }
        BackendSpec::Ftp(info) => Ok(Box::new(FtpHandle::connect(info)?)),
        BackendSpec::Sftp(info) => Ok(Box::new(SftpHandle::connect(info)?)),
    }
}

/// Parses any descriptor, fills missing credentials from the environment and
/// opens it.
pub fn open_descriptor(text: &str) -> FsResult<Box<dyn FileHandle>> {
    open_backend(&BackendSpec::parse(text)?.with_env_credentials())
}

pub(crate) fn resource_spec(url: &Url, text: &str) -> FsResult<BackendSpec> {
    match url.scheme() {
        "file" => Ok(BackendSpec::Local {
            path: host_path(url, text)?,
        }),
        "jar" => {
            // Opaque path: `file:/archive.jar!/member`.
            let (archive, member) = url.path().split_once('!').ok_or_else(|| {
                FsError::invalid_argument("open_url", text, "jar url has no `!` separator")
            })?;
            let archive_url = Url::parse(archive)
                .map_err(|err| FsError::invalid_argument("open_url", text, err.to_string()))?;
            if archive_url.scheme() != "file" {
                return Err(FsError::unsupported("open_url", text));
            }
            let member = decode(member);
            Ok(BackendSpec::Archive {
                archive: host_path(&archive_url, text)?.into(),
                member: if member.is_empty() { "/".to_string() } else { member },
            })
        }
        _ => Err(FsError::unsupported("open_url", text)),
    }
}

fn host_path(url: &Url, text: &str) -> FsResult<String> {
    let path = url
        .to_file_path()
        .map_err(|_| FsError::invalid_argument("open_url", text, "not a local file url"))?;
    path.into_os_string()
        .into_string()
        .map_err(|_| FsError::invalid_argument("open_url", text, "path is not valid UTF-8"))
}
