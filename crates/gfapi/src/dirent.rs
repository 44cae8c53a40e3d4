// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Conversion of raw directory entries and stat buffers into [`FileInfo`]

use std::time::SystemTime;

use crate::types::{FileMode, RawDirent, RawStat};

/// Portable stat result
///
/// A detached value: it keeps no reference to the handle that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    name: String,
    size: u64,
    mode: FileMode,
    mod_time: SystemTime,
    sys: RawStat,
}

impl FileInfo {
    /// Build from a name and a raw stat buffer.
    pub fn from_stat(name: impl Into<String>, stat: &RawStat) -> Self {
        Self {
            name: name.into(),
            size: stat.st_size.max(0) as u64,
            mode: FileMode::from_posix(stat.st_mode),
            mod_time: stat.mtime(),
            sys: *stat,
        }
    }

    /// Base name of the file
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    /// The raw stat buffer this value was built from
    pub fn sys(&self) -> &RawStat {
        &self.sys
    }
}

/// Name stored in a raw entry, stopping at the first NUL or after 256 bytes.
pub fn entry_name(entry: &RawDirent) -> String {
    let len = entry
        .d_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(entry.d_name.len());
    String::from_utf8_lossy(&entry.d_name[..len]).into_owned()
}

/// Materialize one directory entry.
pub fn file_info(entry: &RawDirent, stat: &RawStat) -> FileInfo {
    FileInfo::from_stat(entry_name(entry), stat)
}

/// Final component of a remote path, as `Stat` reports it.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn stat(mode: u32, size: i64) -> RawStat {
        RawStat {
            st_mode: mode,
            st_size: size,
            st_mtime: 1_000,
            st_mtime_nsec: 250,
            ..Default::default()
        }
    }

    #[test]
    fn test_file_info_from_file_entry() {
        let entry = RawDirent::new(7, 1, libc::DT_REG, b"file");
        let info = file_info(&entry, &stat(libc::S_IFREG as u32 | 0o644, 4));

        assert_eq!(info.name(), "file");
        assert_eq!(info.size(), 4);
        assert!(!info.is_dir());
        assert_eq!(info.mode().perm().bits(), 0o644);
        assert_eq!(info.mod_time(), UNIX_EPOCH + Duration::new(1_000, 250));
    }

    #[test]
    fn test_file_info_from_dir_entry() {
        let entry = RawDirent::new(8, 2, libc::DT_DIR, b"dir");
        let info = file_info(&entry, &stat(libc::S_IFDIR as u32 | 0o700, 4096));

        assert!(info.is_dir());
        assert_eq!(info.mode().perm().bits(), 0o700);
        assert_eq!(info.sys().st_size, 4096);
    }

    #[test]
    fn test_negative_size_is_clamped() {
        let info = FileInfo::from_stat("odd", &stat(libc::S_IFREG as u32, -1));
        assert_eq!(info.size(), 0);
    }

    #[test]
    fn test_entry_name_without_terminator() {
        let name = vec![b'a'; 256];
        let entry = RawDirent::new(1, 1, libc::DT_REG, &name);
        assert_eq!(entry_name(&entry).len(), 256);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/a/b/file"), "file");
        assert_eq!(base_name("dir/"), "dir");
        assert_eq!(base_name("plain"), "plain");
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name(""), ".");
    }
}
