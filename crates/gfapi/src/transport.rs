// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The capability set consumed from the remote-volume transport
//!
//! Every call blocks until the transport answers and reports failure as an
//! `io::Error` carrying a raw errno. The session and handle layers above only
//! ever look at that errno.

use std::io::{self, SeekFrom};
use std::path::Path;

use gfapi_logging::LogLevel;

use crate::types::{RawDirent, RawStat, Statvfs};

/// Entry point of a transport: allocates unmounted sessions
pub trait Driver: Send + Sync {
    fn new_session(&self, volname: &str) -> io::Result<Box<dyn RemoteSession>>;
}

/// One remote session, from allocation to `fini`
///
/// Path-addressed calls are only issued between a successful `init` and
/// `fini`.
pub trait RemoteSession: Send + Sync {
    fn set_volfile_server(&mut self, transport: &str, host: &str, port: u16) -> io::Result<()>;
    fn set_logging(&mut self, path: &Path, level: LogLevel) -> io::Result<()>;
    fn init(&mut self) -> io::Result<()>;
    fn fini(&mut self) -> io::Result<()>;

    fn creat(&self, path: &str, flags: i32, mode: u32) -> io::Result<Box<dyn RemoteFd>>;
    fn open(&self, path: &str, flags: i32) -> io::Result<Box<dyn RemoteFd>>;

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    fn rmdir(&self, path: &str) -> io::Result<()>;
    fn unlink(&self, path: &str) -> io::Result<()>;
    fn rename(&self, old: &str, new: &str) -> io::Result<()>;
    fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;
    fn truncate(&self, path: &str, size: u64) -> io::Result<()>;
    fn stat(&self, path: &str) -> io::Result<RawStat>;
    fn statvfs(&self, path: &str) -> io::Result<Statvfs>;

    /// Copy the attribute into `buf`; an empty `buf` only reports its size.
    fn getxattr(&self, path: &str, name: &str, buf: &mut [u8]) -> io::Result<usize>;
    fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()>;
    fn removexattr(&self, path: &str, name: &str) -> io::Result<()>;
}

/// One open remote object
///
/// Directory handles keep their enumeration cursor on the remote side, so
/// `readdirplus` resumes where the previous call stopped.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteFd: Send {
    fn close(&mut self) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    fn fstat(&self) -> io::Result<RawStat>;
    fn fsync(&self) -> io::Result<()>;
    fn ftruncate(&self, size: u64) -> io::Result<()>;
    fn fchmod(&self, mode: u32) -> io::Result<()>;

    /// Next directory entry and its stat; `Ok(None)` once the directory is
    /// exhausted.
    fn readdirplus(&mut self) -> io::Result<Option<(RawDirent, RawStat)>>;

    fn readdir(&mut self) -> io::Result<Option<RawDirent>> {
        Ok(self.readdirplus()?.map(|(entry, _)| entry))
    }

    fn fgetxattr(&self, name: &str, buf: &mut [u8]) -> io::Result<usize>;
    fn fsetxattr(&self, name: &str, value: &[u8], flags: i32) -> io::Result<()>;
    fn fremovexattr(&self, name: &str) -> io::Result<()>;
}
