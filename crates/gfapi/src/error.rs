// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the gfapi client

use std::fmt;
use std::io;

use crate::types::MountState;

/// A path-addressed remote call failed
///
/// For `mkdir_all` the path is the prefix at which the walk stopped, not
/// necessarily the path the caller passed in.
#[derive(thiserror::Error, Debug)]
#[error("{op} {path}: {source}")]
pub struct PathError {
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: io::Error,
}

impl PathError {
    pub fn new(op: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Which extended-attribute call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XattrOp {
    /// Size query with an empty destination buffer
    Probe,
    /// Copy of the attribute value into a caller buffer
    Get,
    Set,
    Remove,
}

impl fmt::Display for XattrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            XattrOp::Probe => "getxattr (size probe)",
            XattrOp::Get => "getxattr",
            XattrOp::Set => "setxattr",
            XattrOp::Remove => "removexattr",
        };
        f.write_str(op)
    }
}

/// Client error type
#[derive(thiserror::Error, Debug)]
pub enum GlfsError {
    #[error("cannot allocate session for volume {volume}: {source}")]
    Init {
        volume: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot mount volume {volume}: {source}")]
    Mount {
        volume: String,
        #[source]
        source: io::Error,
    },
    /// Reported for visibility only; the session is released regardless.
    #[error("unmount of volume {volume} reported failure: {source}")]
    Unmount {
        volume: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot set logging to {path}: {source}")]
    Logging {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{op} not allowed while volume is {state}")]
    InvalidState { op: &'static str, state: MountState },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{op} {old} {new}: {source}")]
    Link {
        op: &'static str,
        old: String,
        new: String,
        #[source]
        source: io::Error,
    },
    #[error("{op} {name}: {source}")]
    Io {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: not a directory")]
    NotDirectory { name: String },
    #[error("{name}: file already closed")]
    InvalidHandle { name: String },
    #[error("{op} {attr} on {target}: {source}")]
    Attribute {
        op: XattrOp,
        target: String,
        attr: String,
        #[source]
        source: io::Error,
    },
    #[error("stat {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GlfsError {
    /// Errno carried by the underlying transport failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            GlfsError::Init { source, .. }
            | GlfsError::Mount { source, .. }
            | GlfsError::Unmount { source, .. }
            | GlfsError::Logging { source, .. }
            | GlfsError::Link { source, .. }
            | GlfsError::Io { source, .. }
            | GlfsError::Attribute { source, .. }
            | GlfsError::Stat { source, .. } => source.raw_os_error(),
            GlfsError::Path(err) => err.source.raw_os_error(),
            GlfsError::NotDirectory { .. } => Some(libc::ENOTDIR),
            GlfsError::InvalidHandle { .. } => Some(libc::EBADF),
            GlfsError::InvalidState { .. } => Some(libc::ENOTCONN),
            GlfsError::Config(_) => Some(libc::EINVAL),
        }
    }

    /// Path or name the error refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            GlfsError::Path(err) => Some(&err.path),
            GlfsError::Link { old, .. } => Some(old),
            GlfsError::Io { name, .. }
            | GlfsError::NotDirectory { name }
            | GlfsError::InvalidHandle { name } => Some(name),
            GlfsError::Attribute { target, .. } => Some(target),
            GlfsError::Stat { path, .. } | GlfsError::Logging { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn as_path_error(&self) -> Option<&PathError> {
        match self {
            GlfsError::Path(err) => Some(err),
            _ => None,
        }
    }
}

impl From<GlfsError> for io::Error {
    fn from(err: GlfsError) -> Self {
        match err.raw_os_error() {
            Some(errno) => io::Error::new(io::Error::from_raw_os_error(errno).kind(), err),
            None => io::Error::other(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, GlfsError>;

pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}
