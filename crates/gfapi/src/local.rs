// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volumes served from directories on the local host
//!
//! Each exported volume is backed by one directory, the way a single brick
//! backs a plain distribute volume. Remote paths are cleaned lexically and
//! resolved under the brick root, so `..` never leaves it. Symlinks inside
//! the brick are followed by the host.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use gfapi_logging::LogLevel;
use path_clean::PathClean;
use tracing::debug;

use crate::error::errno;
use crate::transport::{Driver, RemoteFd, RemoteSession};
use crate::types::{AccessMode, RawDirent, RawStat, Statvfs};

/// Driver mapping volume names to brick directories
#[derive(Clone, Default)]
pub struct LocalDriver {
    bricks: Arc<RwLock<HashMap<String, PathBuf>>>,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve volume `name` from the directory `root`.
    pub fn export(self, name: &str, root: impl Into<PathBuf>) -> Self {
        if let Ok(mut bricks) = self.bricks.write() {
            bricks.insert(name.to_string(), root.into());
        }
        self
    }
}

impl Driver for LocalDriver {
    fn new_session(&self, volname: &str) -> io::Result<Box<dyn RemoteSession>> {
        if volname.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        Ok(Box::new(LocalSession {
            bricks: self.bricks.clone(),
            volname: volname.to_string(),
            has_server: false,
            log_file: None,
            root: None,
            connected: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct LocalSession {
    bricks: Arc<RwLock<HashMap<String, PathBuf>>>,
    volname: String,
    has_server: bool,
    log_file: Option<PathBuf>,
    root: Option<PathBuf>,
    connected: Arc<AtomicBool>,
}

impl LocalSession {
    fn root(&self) -> io::Result<&Path> {
        match &self.root {
            Some(root) if self.connected.load(Ordering::Acquire) => Ok(root),
            _ => Err(errno(libc::ENOTCONN)),
        }
    }

    /// Host path backing remote `path`.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let root = self.root()?;
        if path.is_empty() {
            return Err(errno(libc::ENOENT));
        }
        let cleaned = Path::new("/").join(path).clean();
        let relative = cleaned.strip_prefix("/").unwrap_or(&cleaned);
        Ok(root.join(relative))
    }

    fn open_fd(&self, host: PathBuf, file: fs::File, dir: bool) -> io::Result<Box<dyn RemoteFd>> {
        let stream = if dir {
            let root = self.root()?;
            let parent = if host == root {
                host.clone()
            } else {
                host.parent().unwrap_or(root).to_path_buf()
            };
            Some(DirStream {
                path: host,
                parent,
                pos: 0,
                entries: None,
            })
        } else {
            None
        };
        Ok(Box::new(LocalFd {
            handle: Some(Handle { file, dir: stream }),
            connected: self.connected.clone(),
        }))
    }
}

fn open_options(access: &AccessMode, create_mode: Option<u32>) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(access.readable)
        .write(access.writable)
        .append(access.append);
    if access.writable || access.append {
        opts.truncate(access.truncate);
    }
    if let Some(mode) = create_mode {
        // passed as raw flags so read-only creation works too
        let excl = if access.exclusive { libc::O_EXCL } else { 0 };
        opts.mode(mode).custom_flags(libc::O_CREAT | excl);
    }
    opts
}

/// std reports a few argument problems without an errno
fn raw(err: io::Error) -> io::Error {
    if err.raw_os_error().is_some() {
        err
    } else {
        errno(libc::EINVAL)
    }
}

pub(crate) fn raw_stat(meta: &fs::Metadata) -> RawStat {
    RawStat {
        st_dev: meta.dev(),
        st_ino: meta.ino(),
        st_mode: meta.mode(),
        st_nlink: meta.nlink(),
        st_uid: meta.uid(),
        st_gid: meta.gid(),
        st_rdev: meta.rdev(),
        st_size: meta.size() as i64,
        st_blksize: meta.blksize() as i64,
        st_blocks: meta.blocks() as i64,
        st_atime: meta.atime(),
        st_atime_nsec: meta.atime_nsec(),
        st_mtime: meta.mtime(),
        st_mtime_nsec: meta.mtime_nsec(),
        st_ctime: meta.ctime(),
        st_ctime_nsec: meta.ctime_nsec(),
    }
}

impl RemoteSession for LocalSession {
    fn set_volfile_server(&mut self, _transport: &str, host: &str, _port: u16) -> io::Result<()> {
        if host.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        self.has_server = true;
        Ok(())
    }

    fn set_logging(&mut self, path: &Path, level: LogLevel) -> io::Result<()> {
        if path.as_os_str().is_empty() {
            return Err(errno(libc::EINVAL));
        }
        debug!("brick {} logs to {} at {}", self.volname, path.display(), level);
        self.log_file = Some(path.to_path_buf());
        Ok(())
    }

    fn init(&mut self) -> io::Result<()> {
        if !self.has_server {
            return Err(errno(libc::ENOTCONN));
        }
        let root = {
            let bricks = self.bricks.read().map_err(|_| errno(libc::EIO))?;
            bricks.get(&self.volname).cloned().ok_or_else(|| errno(libc::ENOENT))?
        };
        if !fs::metadata(&root)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        debug!("brick {} mounted from {}", self.volname, root.display());
        self.root = Some(root);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn fini(&mut self) -> io::Result<()> {
        self.connected.store(false, Ordering::Release);
        self.root = None;
        Ok(())
    }

    fn creat(&self, path: &str, flags: i32, mode: u32) -> io::Result<Box<dyn RemoteFd>> {
        let host = self.resolve(path)?;
        let access = AccessMode::from_posix(flags | libc::O_CREAT);
        let file = open_options(&access, Some(mode)).open(&host).map_err(raw)?;
        self.open_fd(host, file, false)
    }

    fn open(&self, path: &str, flags: i32) -> io::Result<Box<dyn RemoteFd>> {
        if flags & libc::O_CREAT != 0 {
            return self.creat(path, flags, 0o666);
        }
        let host = self.resolve(path)?;
        let access = AccessMode::from_posix(flags);
        let is_dir = fs::metadata(&host)?.is_dir();
        if is_dir && (access.writable || access.append) {
            return Err(errno(libc::EISDIR));
        }
        let file = open_options(&access, None).open(&host).map_err(raw)?;
        self.open_fd(host, file, is_dir)
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.resolve(path)?)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        let host = self.resolve(path)?;
        if host == self.root()? {
            return Err(errno(libc::EBUSY));
        }
        fs::remove_dir(host)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        let host = self.resolve(path)?;
        if fs::symlink_metadata(&host)?.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        fs::remove_file(host)
    }

    fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        fs::rename(self.resolve(old)?, self.resolve(new)?)
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.resolve(path)?, Permissions::from_mode(mode))
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(path)?)?;
        file.set_len(size)
    }

    fn stat(&self, path: &str) -> io::Result<RawStat> {
        Ok(raw_stat(&fs::metadata(self.resolve(path)?)?))
    }

    fn statvfs(&self, path: &str) -> io::Result<Statvfs> {
        sys::statvfs(&self.resolve(path)?)
    }

    fn getxattr(&self, path: &str, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        sys::getxattr(&self.resolve(path)?, name, buf)
    }

    fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        sys::setxattr(&self.resolve(path)?, name, value, flags)
    }

    fn removexattr(&self, path: &str, name: &str) -> io::Result<()> {
        sys::removexattr(&self.resolve(path)?, name)
    }
}

struct Handle {
    file: fs::File,
    dir: Option<DirStream>,
}

/// Directory cursor: `.`, `..`, then whatever the host lists
struct DirStream {
    path: PathBuf,
    parent: PathBuf,
    pos: usize,
    entries: Option<fs::ReadDir>,
}

impl DirStream {
    fn next_entry(&mut self) -> io::Result<Option<(OsString, fs::Metadata)>> {
        let next = match self.pos {
            0 => Some((OsString::from("."), fs::metadata(&self.path)?)),
            1 => Some((OsString::from(".."), fs::metadata(&self.parent)?)),
            _ => {
                let entries = match &mut self.entries {
                    Some(entries) => entries,
                    None => self.entries.insert(fs::read_dir(&self.path)?),
                };
                match entries.next() {
                    Some(entry) => {
                        let entry = entry?;
                        Some((entry.file_name(), entry.metadata()?))
                    }
                    None => None,
                }
            }
        };
        if next.is_some() {
            self.pos += 1;
        }
        Ok(next)
    }

    fn rewind(&mut self) {
        self.pos = 0;
        self.entries = None;
    }
}

struct LocalFd {
    handle: Option<Handle>,
    connected: Arc<AtomicBool>,
}

impl LocalFd {
    fn handle(&self) -> io::Result<&Handle> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(errno(libc::ENOTCONN));
        }
        self.handle.as_ref().ok_or_else(|| errno(libc::EBADF))
    }

    fn handle_mut(&mut self) -> io::Result<&mut Handle> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(errno(libc::ENOTCONN));
        }
        self.handle.as_mut().ok_or_else(|| errno(libc::EBADF))
    }

    /// The open regular file; directories fail with EISDIR.
    fn file(&self) -> io::Result<&fs::File> {
        let handle = self.handle()?;
        match handle.dir {
            Some(_) => Err(errno(libc::EISDIR)),
            None => Ok(&handle.file),
        }
    }
}

impl RemoteFd for LocalFd {
    fn close(&mut self) -> io::Result<()> {
        self.handle.take().map(drop).ok_or_else(|| errno(libc::EBADF))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        file.write(buf)
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file()?.read_at(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file()?.write_at(buf, offset)
    }

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let handle = self.handle_mut()?;
        match (&mut handle.dir, pos) {
            (Some(dir), SeekFrom::Start(0)) => {
                dir.rewind();
                Ok(0)
            }
            (Some(_), _) => Err(errno(libc::EINVAL)),
            (None, pos) => (&handle.file).seek(pos),
        }
    }

    fn fstat(&self) -> io::Result<RawStat> {
        Ok(raw_stat(&self.handle()?.file.metadata()?))
    }

    fn fsync(&self) -> io::Result<()> {
        self.handle()?.file.sync_all()
    }

    fn ftruncate(&self, size: u64) -> io::Result<()> {
        self.file()?.set_len(size)
    }

    fn fchmod(&self, mode: u32) -> io::Result<()> {
        self.handle()?.file.set_permissions(Permissions::from_mode(mode))
    }

    fn readdirplus(&mut self) -> io::Result<Option<(RawDirent, RawStat)>> {
        let dir = self.handle_mut()?.dir.as_mut().ok_or_else(|| errno(libc::ENOTDIR))?;
        let Some((name, meta)) = dir.next_entry()? else {
            return Ok(None);
        };
        let stat = raw_stat(&meta);
        let entry = RawDirent::new(
            stat.st_ino,
            dir.pos as i64,
            RawDirent::type_from_mode(stat.st_mode),
            name.as_bytes(),
        );
        Ok(Some((entry, stat)))
    }

    fn fgetxattr(&self, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        sys::fgetxattr(self.handle()?.file.as_raw_fd(), name, buf)
    }

    fn fsetxattr(&self, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        sys::fsetxattr(self.handle()?.file.as_raw_fd(), name, value, flags)
    }

    fn fremovexattr(&self, name: &str) -> io::Result<()> {
        sys::fremovexattr(self.handle()?.file.as_raw_fd(), name)
    }
}

mod sys {
    use std::ffi::CString;
    use std::io;
    use std::path::Path;

    use crate::error::errno;
    use crate::types::Statvfs;

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(super) fn cstr(bytes: &[u8]) -> io::Result<CString> {
        CString::new(bytes).map_err(|_| errno(libc::EINVAL))
    }

    pub fn statvfs(path: &Path) -> io::Result<Statvfs> {
        let st = nix::sys::statvfs::statvfs(path).map_err(|e| errno(e as i32))?;
        Ok(Statvfs {
            bsize: st.block_size() as u64,
            frsize: st.fragment_size() as u64,
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            favail: st.files_available() as u64,
            fsid: st.filesystem_id() as u64,
            flag: st.flags().bits() as u64,
            namemax: st.name_max() as u64,
        })
    }

    pub use xattr::*;

    #[cfg(target_os = "linux")]
    mod xattr {
        use std::io;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::io::RawFd;
        use std::path::Path;

        use super::cstr;

        fn size(ret: libc::ssize_t) -> io::Result<usize> {
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        }

        fn unit(ret: libc::c_int) -> io::Result<()> {
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }

        pub fn getxattr(path: &Path, name: &str, buf: &mut [u8]) -> io::Result<usize> {
            let path = cstr(path.as_os_str().as_bytes())?;
            let name = cstr(name.as_bytes())?;
            // SAFETY: both strings are NUL-terminated; buf is valid for its length.
            size(unsafe {
                libc::getxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            })
        }

        pub fn setxattr(path: &Path, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
            let path = cstr(path.as_os_str().as_bytes())?;
            let name = cstr(name.as_bytes())?;
            // SAFETY: as above, value is only read.
            unit(unsafe {
                libc::setxattr(
                    path.as_ptr(),
                    name.as_ptr(),
                    value.as_ptr().cast(),
                    value.len(),
                    flags,
                )
            })
        }

        pub fn removexattr(path: &Path, name: &str) -> io::Result<()> {
            let path = cstr(path.as_os_str().as_bytes())?;
            let name = cstr(name.as_bytes())?;
            // SAFETY: both strings are NUL-terminated.
            unit(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) })
        }

        pub fn fgetxattr(fd: RawFd, name: &str, buf: &mut [u8]) -> io::Result<usize> {
            let name = cstr(name.as_bytes())?;
            // SAFETY: fd is owned by the caller for the duration of the call.
            size(unsafe { libc::fgetxattr(fd, name.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) })
        }

        pub fn fsetxattr(fd: RawFd, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
            let name = cstr(name.as_bytes())?;
            // SAFETY: fd is owned by the caller; value is only read.
            unit(unsafe {
                libc::fsetxattr(fd, name.as_ptr(), value.as_ptr().cast(), value.len(), flags)
            })
        }

        pub fn fremovexattr(fd: RawFd, name: &str) -> io::Result<()> {
            let name = cstr(name.as_bytes())?;
            // SAFETY: fd is owned by the caller.
            unit(unsafe { libc::fremovexattr(fd, name.as_ptr()) })
        }
    }

    #[cfg(not(target_os = "linux"))]
    mod xattr {
        use std::io;
        use std::os::unix::io::RawFd;
        use std::path::Path;

        use crate::error::errno;

        pub fn getxattr(_path: &Path, _name: &str, _buf: &mut [u8]) -> io::Result<usize> {
            Err(errno(libc::ENOTSUP))
        }

        pub fn setxattr(_path: &Path, _name: &str, _value: &[u8], _flags: i32) -> io::Result<()> {
            Err(errno(libc::ENOTSUP))
        }

        pub fn removexattr(_path: &Path, _name: &str) -> io::Result<()> {
            Err(errno(libc::ENOTSUP))
        }

        pub fn fgetxattr(_fd: RawFd, _name: &str, _buf: &mut [u8]) -> io::Result<usize> {
            Err(errno(libc::ENOTSUP))
        }

        pub fn fsetxattr(_fd: RawFd, _name: &str, _value: &[u8], _flags: i32) -> io::Result<()> {
            Err(errno(libc::ENOTSUP))
        }

        pub fn fremovexattr(_fd: RawFd, _name: &str) -> io::Result<()> {
            Err(errno(libc::ENOTSUP))
        }
    }
}
