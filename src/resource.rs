use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::archive::{ArchiveSource, ZipSource};
use crate::config::RESOURCE_PATH_ENV;

/// Turns a logical resource name into a `file:` or `jar:` URL.
pub trait ResourceResolver {
    /// `name` has no leading separator.
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Looks a resource up in an ordered list of directories and zip archives;
/// the first root that contains it wins.
#[derive(Debug, Clone, Default)]
pub struct SearchPathResolver {
    roots: Vec<PathBuf>,
}

impl SearchPathResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// Reads the roots from `POLYFS_RESOURCE_PATH`.
    pub fn from_env() -> Self {
        let roots = env::var_os(RESOURCE_PATH_ENV)
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default();
        Self { roots }
    }

    fn resolve_in_dir(root: &Path, name: &str) -> Option<String> {
        let candidate = root.join(name);
        if !candidate.exists() {
            return None;
        }
        let absolute = candidate.canonicalize().unwrap_or(candidate);
        Url::from_file_path(&absolute).ok().map(String::from)
    }

    fn resolve_in_archive(root: &Path, name: &str) -> Option<String> {
        let source = match ZipSource::open(root) {
            Ok(source) => source,
            Err(err) => {
                debug!(root = %root.display(), "skipping unreadable resource archive: {err}");
                return None;
            }
        };
        let dir_prefix = format!("{}/", name.trim_end_matches('/'));
        let present = source
            .entries()
            .iter()
            .any(|entry| entry.name == name || entry.name.starts_with(dir_prefix.as_str()));
        if !present {
            return None;
        }

        let absolute = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let archive_url = Url::from_file_path(&absolute).ok()?;
        Some(format!("jar:{archive_url}!/{name}"))
    }
}

impl ResourceResolver for SearchPathResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        let found = self.roots.iter().find_map(|root| {
            if root.is_dir() {
                Self::resolve_in_dir(root, name)
            } else if root.is_file() {
                Self::resolve_in_archive(root, name)
            } else {
                None
            }
        });
        debug!(name, found = found.as_deref().unwrap_or("-"), "resource lookup");
        found
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use zip::write::SimpleFileOptions;

    use super::{ResourceResolver, SearchPathResolver};

    fn temp_dir_path(name: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("valid time")
            .as_nanos();
        std::env::temp_dir().join(format!("polyfs_resource_test_{timestamp}_{name}"))
    }

    fn write_zip(path: &PathBuf, files: &[(&str, &str)]) {
        let file = fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            writer.write_all(content.as_bytes()).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    #[test]
    fn directory_roots_resolve_to_file_urls() {
        let root = temp_dir_path("dir_root");
        fs::create_dir_all(root.join("conf")).expect("create root");
        fs::write(root.join("conf/app.toml"), b"x = 1").expect("write");
        let resolver = SearchPathResolver::new(vec![root.clone()]);

        let url = resolver.resolve("conf/app.toml").expect("resolved");
        assert!(url.starts_with("file:///"));
        assert!(url.ends_with("/conf/app.toml"));
        assert_eq!(resolver.resolve("conf/missing.toml"), None);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn archive_roots_resolve_to_jar_urls() {
        let root = temp_dir_path("zip_root");
        fs::create_dir_all(&root).expect("create root");
        let archive = root.join("bundle.jar");
        write_zip(&archive, &[("assets/logo.txt", "logo")]);
        let resolver = SearchPathResolver::new(vec![archive]);

        let url = resolver.resolve("assets/logo.txt").expect("entry");
        assert!(url.starts_with("jar:file:///"));
        assert!(url.ends_with("bundle.jar!/assets/logo.txt"));
        assert!(resolver.resolve("assets").is_some());
        assert_eq!(resolver.resolve("nothing"), None);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn earlier_roots_take_precedence() {
        let root = temp_dir_path("precedence");
        fs::create_dir_all(root.join("first")).expect("create first");
        fs::create_dir_all(root.join("second")).expect("create second");
        fs::write(root.join("first/shared.txt"), b"1").expect("write");
        fs::write(root.join("second/shared.txt"), b"2").expect("write");
        let resolver = SearchPathResolver::new(vec![
            root.join("missing"),
            root.join("first"),
            root.join("second"),
        ]);

        let url = resolver.resolve("shared.txt").expect("resolved");
        assert!(url.contains("/first/shared.txt"));

        let _ = fs::remove_dir_all(root);
    }
}
