use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument for {operation}: {value} ({reason})")]
    InvalidArgument {
        operation: &'static str,
        value: String,
        reason: String,
    },
    #[error("path not found during {operation}: {path}")]
    NotFound {
        operation: &'static str,
        path: String,
    },
    #[error("is a directory during {operation}: {path}")]
    IsADirectory {
        operation: &'static str,
        path: String,
    },
    #[error("not a directory during {operation}: {path}")]
    NotADirectory {
        operation: &'static str,
        path: String,
    },
    #[error("{operation} is not supported for {target}")]
    Unsupported {
        operation: &'static str,
        target: String,
    },
    #[error("io error during {operation} for {path}: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn from_io(operation: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { operation, path },
            io::ErrorKind::NotADirectory => Self::NotADirectory { operation, path },
            io::ErrorKind::IsADirectory => Self::IsADirectory { operation, path },
            _ => Self::Io {
                operation,
                path,
                source,
            },
        }
    }

    /// Wraps a protocol failure without reinterpreting its kind.
    pub fn remote(operation: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn invalid_argument(
        operation: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            operation,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(operation: &'static str, path: impl Into<String>) -> Self {
        Self::NotFound {
            operation,
            path: path.into(),
        }
    }

    pub fn is_a_directory(operation: &'static str, path: impl Into<String>) -> Self {
        Self::IsADirectory {
            operation,
            path: path.into(),
        }
    }

    pub fn not_a_directory(operation: &'static str, path: impl Into<String>) -> Self {
        Self::NotADirectory {
            operation,
            path: path.into(),
        }
    }

    pub fn unsupported(operation: &'static str, target: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            target: target.into(),
        }
    }
}
