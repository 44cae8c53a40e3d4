// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions shared by the session, handle and transport layers

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Transport used to fetch the volume file when none is configured
pub const DEFAULT_TRANSPORT: &str = "tcp";

/// Port of the management daemon serving volume files
pub const DEFAULT_PORT: u16 = 24007;

/// Longest name a directory entry can carry, excluding the terminating NUL
pub const NAME_MAX: usize = 255;

/// `setxattr` flag: fail if the attribute already exists
pub const XATTR_CREATE: i32 = 1;
/// `setxattr` flag: fail if the attribute does not exist
pub const XATTR_REPLACE: i32 = 2;

/// Lifecycle state of a [`Volume`](crate::Volume)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountState {
    Uninitialized,
    Initialized,
    Mounted,
    Unmounted,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MountState::Uninitialized => "uninitialized",
            MountState::Initialized => "initialized",
            MountState::Mounted => "mounted",
            MountState::Unmounted => "unmounted",
        };
        f.write_str(state)
    }
}

/// Open flags for [`Volume::open_file`](crate::Volume::open_file)
///
/// Converted to POSIX `O_*` flags before crossing the transport.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Flags used by `Volume::create`: read-write, create, truncate.
    pub fn create_truncate() -> Self {
        Self {
            read: true,
            write: true,
            truncate: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Whether the transport has to be asked to create the object.
    pub fn creates(&self) -> bool {
        self.create || self.create_new
    }

    pub fn to_posix(&self) -> i32 {
        let mut flags = match (self.read, self.write || self.append) {
            (_, false) => libc::O_RDONLY,
            (false, true) => libc::O_WRONLY,
            (true, true) => libc::O_RDWR,
        };
        if self.append {
            flags |= libc::O_APPEND;
        }
        if self.truncate {
            flags |= libc::O_TRUNC;
        }
        if self.create_new {
            flags |= libc::O_CREAT | libc::O_EXCL;
        } else if self.create {
            flags |= libc::O_CREAT;
        }
        flags
    }
}

/// Access mode and modifiers decoded from POSIX open flags
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessMode {
    pub readable: bool,
    pub writable: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub exclusive: bool,
}

impl AccessMode {
    pub fn from_posix(flags: i32) -> Self {
        let acc = flags & libc::O_ACCMODE;
        Self {
            readable: acc == libc::O_RDONLY || acc == libc::O_RDWR,
            writable: acc == libc::O_WRONLY || acc == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
        }
    }
}

/// Portable file mode: permission bits plus type bits
///
/// The type bits live above the POSIX permission range so a mode can be
/// masked with [`FileMode::PERM`] to recover exactly what was passed to
/// `mkdir`/`chmod`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileMode(u32);

impl FileMode {
    pub const DIR: FileMode = FileMode(1 << 31);
    pub const SYMLINK: FileMode = FileMode(1 << 27);
    pub const DEVICE: FileMode = FileMode(1 << 26);
    pub const NAMED_PIPE: FileMode = FileMode(1 << 25);
    pub const SOCKET: FileMode = FileMode(1 << 24);
    pub const SETUID: FileMode = FileMode(1 << 23);
    pub const SETGID: FileMode = FileMode(1 << 22);
    pub const CHAR_DEVICE: FileMode = FileMode(1 << 21);
    pub const STICKY: FileMode = FileMode(1 << 20);

    /// Unix permission bits
    pub const PERM: FileMode = FileMode(0o777);

    pub const TYPE: FileMode = FileMode(
        Self::DIR.0
            | Self::SYMLINK.0
            | Self::DEVICE.0
            | Self::NAMED_PIPE.0
            | Self::SOCKET.0
            | Self::CHAR_DEVICE.0,
    );

    pub const fn new(bits: u32) -> Self {
        FileMode(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn perm(self) -> FileMode {
        FileMode(self.0 & Self::PERM.0)
    }

    pub fn is_dir(self) -> bool {
        self.contains(Self::DIR)
    }

    pub fn is_regular(self) -> bool {
        self.0 & Self::TYPE.0 == 0
    }

    pub fn contains(self, other: FileMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Translate a raw `st_mode` into a portable mode.
    pub fn from_posix(st_mode: u32) -> Self {
        let mut mode = st_mode & Self::PERM.0;
        match st_mode & libc::S_IFMT as u32 {
            t if t == libc::S_IFDIR as u32 => mode |= Self::DIR.0,
            t if t == libc::S_IFLNK as u32 => mode |= Self::SYMLINK.0,
            t if t == libc::S_IFIFO as u32 => mode |= Self::NAMED_PIPE.0,
            t if t == libc::S_IFSOCK as u32 => mode |= Self::SOCKET.0,
            t if t == libc::S_IFBLK as u32 => mode |= Self::DEVICE.0,
            t if t == libc::S_IFCHR as u32 => mode |= Self::DEVICE.0 | Self::CHAR_DEVICE.0,
            _ => {}
        }
        if st_mode & libc::S_ISUID as u32 != 0 {
            mode |= Self::SETUID.0;
        }
        if st_mode & libc::S_ISGID as u32 != 0 {
            mode |= Self::SETGID.0;
        }
        if st_mode & libc::S_ISVTX as u32 != 0 {
            mode |= Self::STICKY.0;
        }
        FileMode(mode)
    }

    /// Permission and special bits as understood by `chmod(2)`.
    pub fn to_posix(self) -> u32 {
        let mut mode = self.0 & Self::PERM.0;
        if self.contains(Self::SETUID) {
            mode |= libc::S_ISUID as u32;
        }
        if self.contains(Self::SETGID) {
            mode |= libc::S_ISGID as u32;
        }
        if self.contains(Self::STICKY) {
            mode |= libc::S_ISVTX as u32;
        }
        mode
    }
}

impl From<u32> for FileMode {
    fn from(bits: u32) -> Self {
        FileMode(bits)
    }
}

impl std::ops::BitAnd for FileMode {
    type Output = FileMode;

    fn bitand(self, rhs: FileMode) -> FileMode {
        FileMode(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for FileMode {
    type Output = FileMode;

    fn bitor(self, rhs: FileMode) -> FileMode {
        FileMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:#o}, {})", self.perm().bits(), self)
    }
}

/// `ls -l` style rendering, e.g. `drwx------`
impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_dir() {
            'd'
        } else if self.contains(Self::SYMLINK) {
            'L'
        } else if self.contains(Self::NAMED_PIPE) {
            'p'
        } else if self.contains(Self::SOCKET) {
            'S'
        } else if self.contains(Self::CHAR_DEVICE) {
            'c'
        } else if self.contains(Self::DEVICE) {
            'D'
        } else {
            '-'
        };
        let mut out = String::with_capacity(10);
        out.push(kind);
        const RWX: &[u8; 3] = b"rwx";
        for bit in (0..9).rev() {
            if self.0 & (1 << bit) != 0 {
                out.push(RWX[2 - bit % 3] as char);
            } else {
                out.push('-');
            }
        }
        f.write_str(&out)
    }
}

/// Raw stat buffer as returned by the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawStat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_atime_nsec: i64,
    pub st_mtime: i64,
    pub st_mtime_nsec: i64,
    pub st_ctime: i64,
    pub st_ctime_nsec: i64,
}

impl RawStat {
    pub fn is_dir(&self) -> bool {
        self.st_mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn mtime(&self) -> SystemTime {
        timespec_to_system_time(self.st_mtime, self.st_mtime_nsec)
    }
}

pub(crate) fn timespec_to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0) + Duration::new(0, nsecs)
    }
}

pub(crate) fn system_time_to_timespec(time: SystemTime) -> (i64, i64) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
        // tv_nsec stays in [0, 1e9) so a fractional pre-epoch time borrows a second
        Err(e) => {
            let d = e.duration();
            let secs = d.as_secs() as i64;
            match d.subsec_nanos() {
                0 => (-secs, 0),
                nanos => (-secs - 1, 1_000_000_000 - nanos as i64),
            }
        }
    }
}

/// Raw directory entry, one per "next entry" call
#[derive(Clone, Copy)]
pub struct RawDirent {
    pub d_ino: u64,
    pub d_off: i64,
    pub d_type: u8,
    /// NUL-terminated unless the name fills all 256 bytes
    pub d_name: [u8; NAME_MAX + 1],
}

impl RawDirent {
    /// Build an entry, truncating `name` to the 256-byte name field.
    pub fn new(d_ino: u64, d_off: i64, d_type: u8, name: &[u8]) -> Self {
        let mut d_name = [0u8; NAME_MAX + 1];
        let len = name.len().min(d_name.len());
        d_name[..len].copy_from_slice(&name[..len]);
        Self {
            d_ino,
            d_off,
            d_type,
            d_name,
        }
    }

    /// Entry type derived from a raw `st_mode`, as `readdir` reports it.
    pub fn type_from_mode(st_mode: u32) -> u8 {
        match st_mode & libc::S_IFMT as u32 {
            t if t == libc::S_IFDIR as u32 => libc::DT_DIR,
            t if t == libc::S_IFREG as u32 => libc::DT_REG,
            t if t == libc::S_IFLNK as u32 => libc::DT_LNK,
            t if t == libc::S_IFIFO as u32 => libc::DT_FIFO,
            t if t == libc::S_IFSOCK as u32 => libc::DT_SOCK,
            t if t == libc::S_IFCHR as u32 => libc::DT_CHR,
            t if t == libc::S_IFBLK as u32 => libc::DT_BLK,
            _ => libc::DT_UNKNOWN,
        }
    }
}

impl fmt::Debug for RawDirent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDirent")
            .field("d_ino", &self.d_ino)
            .field("d_off", &self.d_off)
            .field("d_type", &self.d_type)
            .field("d_name", &crate::dirent::entry_name(self))
            .finish()
    }
}

/// Filesystem-level statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statvfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}
