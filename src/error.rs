use std::path::PathBuf;

use thiserror::Error;

/// Failure to open, size or map the shared simulation region.
///
/// Never fatal: callers fall back to the real clock.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid shared memory name {0:?}")]
    InvalidName(String),

    #[error("cannot open shared memory object {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot resize shared memory object {name}: {source}")]
    Resize {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot map shared memory object {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shared memory object {name} has layout version {found}, expected {expected}")]
    VersionMismatch {
        name: String,
        found: u32,
        expected: u32,
    },
}

/// The genuine implementation of a libc symbol could not be found.
#[derive(Debug, Error)]
#[error("cannot resolve real `{symbol}`: {reason}")]
pub struct SymbolResolutionError {
    pub symbol: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no users file at {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot read users file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("out of memory after loading {loaded} users")]
    OutOfMemory { loaded: usize },
}

/// A name or uid that is not in the identity directory. Expected outcome,
/// not a fault.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("no user named {0:?}")]
    Name(String),

    #[error("no user with uid {0}")]
    Uid(u32),
}
