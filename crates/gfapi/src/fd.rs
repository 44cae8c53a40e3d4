// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Low-level operations on one open remote object, like the ones in the
//! `syscall` layer of a local filesystem

use std::io::{self, SeekFrom};

use crate::error::{GlfsError, Result, XattrOp};
use crate::transport::RemoteFd;
use crate::types::{RawDirent, RawStat};

/// Exclusive owner of one remote handle
///
/// The handle is released exactly once, by [`Fd::close`] or on drop. Every
/// call after that fails with [`GlfsError::InvalidHandle`] without reaching
/// the transport.
pub struct Fd {
    name: String,
    inner: Option<Box<dyn RemoteFd>>,
}

impl Fd {
    pub(crate) fn new(name: impl Into<String>, inner: Box<dyn RemoteFd>) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
        }
    }

    /// Path the handle was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    fn remote(&self) -> Result<&dyn RemoteFd> {
        match &self.inner {
            Some(fd) => Ok(fd.as_ref()),
            None => Err(self.invalid()),
        }
    }

    fn remote_mut(&mut self) -> Result<&mut (dyn RemoteFd + 'static)> {
        match &mut self.inner {
            Some(fd) => Ok(fd.as_mut()),
            None => Err(GlfsError::InvalidHandle {
                name: self.name.clone(),
            }),
        }
    }

    fn invalid(&self) -> GlfsError {
        GlfsError::InvalidHandle {
            name: self.name.clone(),
        }
    }

    fn io_err(&self, op: &'static str, source: io::Error) -> GlfsError {
        GlfsError::Io {
            op,
            name: self.name.clone(),
            source,
        }
    }

    /// Release the handle. A second call fails with `InvalidHandle`.
    pub fn close(&mut self) -> Result<()> {
        let mut fd = self.inner.take().ok_or_else(|| self.invalid())?;
        tracing::debug!("close {}", self.name);
        fd.close().map_err(|e| self.io_err("close", e))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let res = self.remote_mut()?.read(buf);
        res.map_err(|e| self.io_err("read", e))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let res = self.remote_mut()?.write(buf);
        res.map_err(|e| self.io_err("write", e))
    }

    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.remote()?.pread(buf, offset).map_err(|e| self.io_err("pread", e))
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.remote()?.pwrite(buf, offset).map_err(|e| self.io_err("pwrite", e))
    }

    pub fn lseek(&mut self, pos: SeekFrom) -> Result<u64> {
        let res = self.remote_mut()?.lseek(pos);
        res.map_err(|e| self.io_err("seek", e))
    }

    pub fn fstat(&self) -> Result<RawStat> {
        self.remote()?.fstat().map_err(|source| GlfsError::Stat {
            path: self.name.clone(),
            source,
        })
    }

    pub fn fsync(&self) -> Result<()> {
        self.remote()?.fsync().map_err(|e| self.io_err("fsync", e))
    }

    pub fn ftruncate(&self, size: u64) -> Result<()> {
        self.remote()?.ftruncate(size).map_err(|e| self.io_err("truncate", e))
    }

    pub fn fchmod(&self, mode: u32) -> Result<()> {
        self.remote()?.fchmod(mode).map_err(|e| self.io_err("chmod", e))
    }

    /// Next entry of a directory handle together with its stat.
    pub fn readdirplus(&mut self) -> Result<Option<(RawDirent, RawStat)>> {
        let res = self.remote_mut()?.readdirplus();
        res.map_err(|e| self.dir_err(e))
    }

    /// Next entry of a directory handle.
    pub fn readdir(&mut self) -> Result<Option<RawDirent>> {
        let res = self.remote_mut()?.readdir();
        res.map_err(|e| self.dir_err(e))
    }

    fn dir_err(&self, source: io::Error) -> GlfsError {
        if source.raw_os_error() == Some(libc::ENOTDIR) {
            GlfsError::NotDirectory {
                name: self.name.clone(),
            }
        } else {
            self.io_err("readdir", source)
        }
    }

    /// Read an attribute; an empty `dest` only returns the value's size.
    pub fn fgetxattr(&self, attr: &str, dest: &mut [u8]) -> Result<usize> {
        let op = if dest.is_empty() {
            XattrOp::Probe
        } else {
            XattrOp::Get
        };
        self.remote()?.fgetxattr(attr, dest).map_err(|e| self.xattr_err(op, attr, e))
    }

    pub fn fsetxattr(&self, attr: &str, value: &[u8], flags: i32) -> Result<()> {
        self.remote()?
            .fsetxattr(attr, value, flags)
            .map_err(|e| self.xattr_err(XattrOp::Set, attr, e))
    }

    pub fn fremovexattr(&self, attr: &str) -> Result<()> {
        self.remote()?
            .fremovexattr(attr)
            .map_err(|e| self.xattr_err(XattrOp::Remove, attr, e))
    }

    fn xattr_err(&self, op: XattrOp, attr: &str, source: io::Error) -> GlfsError {
        GlfsError::Attribute {
            op,
            target: self.name.clone(),
            attr: attr.to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Some(mut fd) = self.inner.take() {
            if let Err(e) = fd.close() {
                tracing::warn!("Failed to close {} on drop: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRemoteFd;

    #[test]
    fn test_close_is_forwarded_once() {
        let mut mock = MockRemoteFd::new();
        mock.expect_close().times(1).returning(|| Ok(()));

        let mut fd = Fd::new("/f", Box::new(mock));
        fd.close().expect("first close");
        assert!(fd.is_closed());

        let err = fd.close().unwrap_err();
        assert!(matches!(err, GlfsError::InvalidHandle { ref name } if name == "/f"));
    }

    #[test]
    fn test_use_after_close_never_reaches_transport() {
        let mut mock = MockRemoteFd::new();
        mock.expect_close().times(1).returning(|| Ok(()));
        mock.expect_read().never();
        mock.expect_pwrite().never();

        let mut fd = Fd::new("/f", Box::new(mock));
        fd.close().unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(fd.read(&mut buf), Err(GlfsError::InvalidHandle { .. })));
        assert!(matches!(fd.pwrite(b"data", 0), Err(GlfsError::InvalidHandle { .. })));
    }

    #[test]
    fn test_drop_closes_open_handle() {
        let mut mock = MockRemoteFd::new();
        mock.expect_close().times(1).returning(|| Ok(()));
        drop(Fd::new("/f", Box::new(mock)));
    }

    #[test]
    fn test_drop_swallows_close_failure() {
        let mut mock = MockRemoteFd::new();
        mock.expect_close()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::EIO)));
        drop(Fd::new("/f", Box::new(mock)));
    }

    #[test]
    fn test_enotdir_becomes_not_directory() {
        let mut mock = MockRemoteFd::new();
        mock.expect_readdirplus()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::ENOTDIR)));
        mock.expect_close().returning(|| Ok(()));

        let mut fd = Fd::new("/file", Box::new(mock));
        let err = fd.readdirplus().unwrap_err();
        assert!(matches!(err, GlfsError::NotDirectory { ref name } if name == "/file"));
    }

    #[test]
    fn test_xattr_probe_and_copy_are_distinguished() {
        let mut mock = MockRemoteFd::new();
        mock.expect_fgetxattr()
            .returning(|_, _| Err(io::Error::from_raw_os_error(libc::ENODATA)));
        mock.expect_close().returning(|| Ok(()));

        let fd = Fd::new("/f", Box::new(mock));
        let probe = fd.fgetxattr("user.k", &mut []).unwrap_err();
        assert!(matches!(probe, GlfsError::Attribute { op: XattrOp::Probe, .. }));

        let mut buf = [0u8; 8];
        let copy = fd.fgetxattr("user.k", &mut buf).unwrap_err();
        assert!(matches!(copy, GlfsError::Attribute { op: XattrOp::Get, .. }));
        assert_eq!(copy.raw_os_error(), Some(libc::ENODATA));
    }
}
