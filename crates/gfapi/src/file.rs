// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File-like API over an open remote handle

use std::io::{self, SeekFrom};

use crate::dirent::{base_name, entry_name, file_info, FileInfo};
use crate::error::Result;
use crate::fd::Fd;
use crate::transport::RemoteFd;

/// An open remote file or directory
///
/// Obtained from [`Volume::create`](crate::Volume::create),
/// [`Volume::open`](crate::Volume::open) or
/// [`Volume::open_file`](crate::Volume::open_file). The handle is closed on
/// drop if [`File::close`] was not called.
#[derive(Debug)]
pub struct File {
    fd: Fd,
}

impl File {
    pub(crate) fn new(name: &str, inner: Box<dyn RemoteFd>) -> Self {
        Self {
            fd: Fd::new(name, inner),
        }
    }

    /// Path this file was opened with.
    pub fn name(&self) -> &str {
        self.fd.name()
    }

    /// The underlying handle operations.
    pub fn fd(&self) -> &Fd {
        &self.fd
    }

    pub fn close(&mut self) -> Result<()> {
        self.fd.close()
    }

    /// Read at the current offset and advance it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fd.read(buf)
    }

    /// Write at the current offset and advance it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.fd.write(buf)
    }

    pub fn write_string(&mut self, s: &str) -> Result<usize> {
        self.fd.write(s.as_bytes())
    }

    /// Positional read; the current offset is left untouched.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.fd.pread(buf, offset)
    }

    /// Positional write; the current offset is left untouched.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.fd.pwrite(buf, offset)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.fd.lseek(pos)
    }

    /// Stat the open object; the name is the base name of [`File::name`].
    pub fn stat(&self) -> Result<FileInfo> {
        let stat = self.fd.fstat()?;
        Ok(FileInfo::from_stat(base_name(self.fd.name()), &stat))
    }

    pub fn sync(&self) -> Result<()> {
        self.fd.fsync()
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.fd.ftruncate(size)
    }

    /// Change permission bits, given as POSIX mode bits.
    pub fn chmod(&self, mode: u32) -> Result<()> {
        self.fd.fchmod(mode)
    }

    /// Accepted for API parity; has no effect.
    pub fn chdir(&self) -> Result<()> {
        Ok(())
    }

    /// Accepted for API parity; has no effect.
    pub fn chown(&self, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }

    /// Up to `n` entries from the directory cursor, or every remaining entry
    /// when `n` is zero. An exhausted directory yields an empty vector.
    pub fn readdir(&mut self, n: usize) -> Result<Vec<FileInfo>> {
        self.entries().take(limit(n)).collect()
    }

    /// Like [`File::readdir`] but only the entry names.
    pub fn readdirnames(&mut self, n: usize) -> Result<Vec<String>> {
        self.entry_names().take(limit(n)).collect()
    }

    /// Lazy iterator over the remaining directory entries.
    ///
    /// One remote call is issued per item; iteration stops after the first
    /// error.
    pub fn entries(&mut self) -> Entries<'_> {
        Entries {
            fd: &mut self.fd,
            done: false,
        }
    }

    pub fn entry_names(&mut self) -> EntryNames<'_> {
        EntryNames {
            fd: &mut self.fd,
            done: false,
        }
    }

    pub fn getxattr(&self, attr: &str, dest: &mut [u8]) -> Result<usize> {
        self.fd.fgetxattr(attr, dest)
    }

    /// Probe the attribute size, then fetch the whole value.
    pub fn getxattr_vec(&self, attr: &str) -> Result<Vec<u8>> {
        let size = self.fd.fgetxattr(attr, &mut [])?;
        let mut value = vec![0u8; size];
        let read = self.fd.fgetxattr(attr, &mut value)?;
        value.truncate(read);
        Ok(value)
    }

    pub fn setxattr(&self, attr: &str, value: &[u8], flags: i32) -> Result<()> {
        self.fd.fsetxattr(attr, value, flags)
    }

    pub fn removexattr(&self, attr: &str) -> Result<()> {
        self.fd.fremovexattr(attr)
    }
}

fn limit(n: usize) -> usize {
    if n == 0 {
        usize::MAX
    } else {
        n
    }
}

/// Iterator returned by [`File::entries`]
pub struct Entries<'a> {
    fd: &'a mut Fd,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fd.readdirplus() {
            Ok(Some((entry, stat))) => Some(Ok(file_info(&entry, &stat))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator returned by [`File::entry_names`]
pub struct EntryNames<'a> {
    fd: &'a mut Fd,
    done: bool,
}

impl Iterator for EntryNames<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fd.readdir() {
            Ok(Some(entry)) => Some(Ok(entry_name(&entry))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl io::Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.fd.read(buf)?)
    }
}

impl io::Write for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.fd.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.fd.lseek(pos)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GlfsError;
    use crate::transport::MockRemoteFd;
    use crate::types::{RawDirent, RawStat};
    use mockall::Sequence;

    fn dir_stat() -> RawStat {
        RawStat {
            st_mode: libc::S_IFDIR as u32 | 0o755,
            st_size: 4096,
            ..Default::default()
        }
    }

    fn entry(name: &str) -> (RawDirent, RawStat) {
        (RawDirent::new(1, 0, libc::DT_DIR, name.as_bytes()), dir_stat())
    }

    /// A directory stream that hands out `names` in order, then reports the
    /// end, expecting exactly `calls` remote calls.
    fn dir_mock(names: &'static [&'static str], calls: usize) -> MockRemoteFd {
        let mut mock = MockRemoteFd::new();
        let mut seq = Sequence::new();
        for &name in names.iter().take(calls) {
            mock.expect_readdirplus()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move || Ok(Some(entry(name))));
        }
        if calls > names.len() {
            mock.expect_readdirplus()
                .times(calls - names.len())
                .in_sequence(&mut seq)
                .returning(|| Ok(None));
        }
        mock.expect_close().times(1).returning(|| Ok(()));
        mock
    }

    #[test]
    fn test_readdir_batches_follow_cursor() {
        // 2 + 2 entries, then one call that reports the end
        let mock = dir_mock(&[".", "..", "a", "b"], 5);
        let mut dir = File::new("/d", Box::new(mock));

        let first = dir.readdir(2).unwrap();
        assert_eq!(first.iter().map(|i| i.name()).collect::<Vec<_>>(), [".", ".."]);
        let second = dir.readdir(2).unwrap();
        assert_eq!(second.iter().map(|i| i.name()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(dir.readdir(2).unwrap().is_empty());
    }

    #[test]
    fn test_readdir_zero_reads_everything() {
        let mock = dir_mock(&[".", "..", "a"], 4);
        let mut dir = File::new("/d", Box::new(mock));

        let all = dir.readdir(0).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|i| i.is_dir()));
    }

    #[test]
    fn test_readdir_on_regular_file() {
        let mut mock = MockRemoteFd::new();
        mock.expect_readdirplus()
            .times(1)
            .returning(|| Err(io::Error::from_raw_os_error(libc::ENOTDIR)));
        mock.expect_close().returning(|| Ok(()));

        let mut file = File::new("/f", Box::new(mock));
        assert!(matches!(file.readdir(1), Err(GlfsError::NotDirectory { .. })));
    }

    #[test]
    fn test_stat_uses_base_name() {
        let mut mock = MockRemoteFd::new();
        mock.expect_fstat().returning(|| {
            Ok(RawStat {
                st_mode: libc::S_IFREG as u32 | 0o644,
                st_size: 4,
                ..Default::default()
            })
        });
        mock.expect_close().returning(|| Ok(()));

        let file = File::new("/dir/file", Box::new(mock));
        let info = file.stat().unwrap();
        assert_eq!(info.name(), "file");
        assert_eq!(info.size(), 4);
    }

    #[test]
    fn test_write_string_and_io_traits() {
        use std::io::{Seek, Write};

        let mut mock = MockRemoteFd::new();
        mock.expect_write().times(2).returning(|buf| Ok(buf.len()));
        mock.expect_lseek()
            .withf(|pos| *pos == SeekFrom::Start(0))
            .returning(|_| Ok(0));
        mock.expect_close().returning(|| Ok(()));

        let mut file = File::new("/f", Box::new(mock));
        assert_eq!(file.write_string("data").unwrap(), 4);
        Write::write_all(&mut file, b"more").unwrap();
        assert_eq!(Seek::seek(&mut file, SeekFrom::Start(0)).unwrap(), 0);
    }

    #[test]
    fn test_io_error_after_close() {
        use std::io::Read;

        let mut mock = MockRemoteFd::new();
        mock.expect_close().times(1).returning(|| Ok(()));

        let mut file = File::new("/f", Box::new(mock));
        file.close().unwrap();
        let err = Read::read(&mut file, &mut [0u8; 1]).unwrap_err();
        assert!(err.to_string().contains("already closed"), "{err}");
        assert!(matches!(file.close(), Err(GlfsError::InvalidHandle { .. })));
    }

    #[test]
    fn test_chdir_and_chown_are_noops() {
        let mut mock = MockRemoteFd::new();
        mock.expect_close().returning(|| Ok(()));
        let file = File::new("/f", Box::new(mock));
        file.chdir().unwrap();
        file.chown(1000, 1000).unwrap();
    }

    #[test]
    fn test_getxattr_vec_probes_then_copies() {
        let mut mock = MockRemoteFd::new();
        let mut seq = Sequence::new();
        mock.expect_fgetxattr()
            .withf(|_, buf| buf.is_empty())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(5));
        mock.expect_fgetxattr()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf.copy_from_slice(b"hello");
                Ok(5)
            });
        mock.expect_close().returning(|| Ok(()));

        let file = File::new("/f", Box::new(mock));
        assert_eq!(file.getxattr_vec("user.greeting").unwrap(), b"hello");
    }
}
