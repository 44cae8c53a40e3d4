// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client for remote distributed-filesystem volumes
//!
//! A [`Volume`] owns one session with a remote volume and exposes
//! path-addressed operations; opening a path yields a [`File`] that owns one
//! remote handle. Everything below that goes through the [`transport`]
//! traits, so the same client runs against a networked transport, the
//! in-process [`memory::MemDriver`] or the host-directory
//! [`local::LocalDriver`].
//!
//! Calls block until the transport answers. A mounted `Volume` can be shared
//! between threads by reference; a `File` is used by one thread at a time,
//! and directory pagination on one handle must not be driven concurrently.

pub mod config;
pub mod dirent;
pub mod error;
pub mod fault;
pub mod fd;
pub mod file;
#[cfg(unix)]
pub mod local;
pub mod memory;
pub mod path;
pub mod transport;
pub mod types;
pub mod volume;

pub use config::{VolumeConfig, VolumeConfigBuilder};
pub use dirent::FileInfo;
pub use error::{GlfsError, PathError, Result, XattrOp};
pub use fd::Fd;
pub use file::{Entries, EntryNames, File};
pub use gfapi_logging::LogLevel;
pub use transport::{Driver, RemoteFd, RemoteSession};
pub use types::{
    FileMode, MountState, OpenFlags, RawDirent, RawStat, Statvfs, DEFAULT_PORT, DEFAULT_TRANSPORT,
    XATTR_CREATE, XATTR_REPLACE,
};
pub use volume::Volume;
