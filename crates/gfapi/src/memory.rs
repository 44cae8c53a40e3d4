// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process volume server
//!
//! Each exported volume is a tree of inodes behind one mutex. Sessions and
//! handles talk to it through the same traits a networked transport
//! implements, so everything above the transport seam runs unchanged.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::hash::{Hash, Hasher};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use gfapi_logging::LogLevel;

use crate::error::errno;
use crate::transport::{Driver, RemoteFd, RemoteSession};
use crate::types::{
    system_time_to_timespec, AccessMode, RawDirent, RawStat, Statvfs, NAME_MAX, XATTR_CREATE,
    XATTR_REPLACE,
};

const ROOT_INO: u64 = 1;
const BLOCK_SIZE: u64 = 4096;
const DEFAULT_CAPACITY: u64 = 1 << 30;
const MAX_INODES: u64 = 1 << 20;
const MAX_FILE_SIZE: u64 = 1 << 40;
const XATTR_SIZE_MAX: usize = 64 * 1024;
const XATTR_NAMESPACES: &[&str] = &["user.", "trusted.", "security.", "system."];
const TRANSPORTS: &[&str] = &["tcp", "rdma", "unix"];

/// Driver serving volumes from memory
#[derive(Clone, Default)]
pub struct MemDriver {
    exports: Arc<Exports>,
}

#[derive(Default)]
struct Exports {
    volumes: Mutex<HashMap<String, Arc<MemVolume>>>,
    logging: Mutex<HashMap<String, (PathBuf, LogLevel)>>,
}

impl MemDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export an empty volume called `name`.
    pub fn export(self, name: &str) -> Self {
        self.export_with_capacity(name, DEFAULT_CAPACITY)
    }

    /// Export an empty volume whose `statvfs` reports `capacity` bytes.
    pub fn export_with_capacity(self, name: &str, capacity: u64) -> Self {
        if let Ok(mut volumes) = self.exports.volumes.lock() {
            volumes.insert(name.to_string(), Arc::new(MemVolume::new(name, capacity)));
        }
        self
    }

    /// Logging settings most recently sent by a session of `volname`.
    pub fn logging(&self, volname: &str) -> Option<(PathBuf, LogLevel)> {
        self.exports.logging.lock().ok()?.get(volname).cloned()
    }
}

impl Driver for MemDriver {
    fn new_session(&self, volname: &str) -> io::Result<Box<dyn RemoteSession>> {
        if volname.is_empty() {
            return Err(errno(libc::EINVAL));
        }
        Ok(Box::new(MemSession {
            exports: self.exports.clone(),
            volname: volname.to_string(),
            server: None,
            volume: None,
            connected: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemSession {
    exports: Arc<Exports>,
    volname: String,
    server: Option<(String, String, u16)>,
    volume: Option<Arc<MemVolume>>,
    /// Shared with every handle opened through this session
    connected: Arc<AtomicBool>,
}

impl MemSession {
    fn volume(&self) -> io::Result<&Arc<MemVolume>> {
        match &self.volume {
            Some(volume) if self.connected.load(Ordering::Acquire) => Ok(volume),
            _ => Err(errno(libc::ENOTCONN)),
        }
    }

    fn open_fd(
        &self,
        volume: &Arc<MemVolume>,
        tree: &mut Tree,
        ino: u64,
        access: AccessMode,
    ) -> Box<dyn RemoteFd> {
        if let Some(node) = tree.nodes.get_mut(&ino) {
            node.open_count += 1;
        }
        Box::new(MemFd {
            volume: volume.clone(),
            connected: self.connected.clone(),
            ino,
            access,
            offset: 0,
            dir_pos: 0,
            cursor: DirCursor::default(),
            closed: false,
        })
    }
}

impl RemoteSession for MemSession {
    fn set_volfile_server(&mut self, transport: &str, host: &str, port: u16) -> io::Result<()> {
        if !TRANSPORTS.contains(&transport) || host.is_empty() || port == 0 {
            return Err(errno(libc::EINVAL));
        }
        self.server = Some((transport.to_string(), host.to_string(), port));
        Ok(())
    }

    fn set_logging(&mut self, path: &Path, level: LogLevel) -> io::Result<()> {
        if path.as_os_str().is_empty() {
            return Err(errno(libc::EINVAL));
        }
        let mut logging = self.exports.logging.lock().map_err(|_| errno(libc::EIO))?;
        logging.insert(self.volname.clone(), (path.to_path_buf(), level));
        Ok(())
    }

    fn init(&mut self) -> io::Result<()> {
        if self.server.is_none() {
            return Err(errno(libc::ENOTCONN));
        }
        if self.connected.load(Ordering::Acquire) {
            return Err(errno(libc::EBUSY));
        }
        let volume = {
            let volumes = self.exports.volumes.lock().map_err(|_| errno(libc::EIO))?;
            volumes.get(&self.volname).cloned().ok_or_else(|| errno(libc::ENOENT))?
        };
        self.volume = Some(volume);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn fini(&mut self) -> io::Result<()> {
        self.connected.store(false, Ordering::Release);
        self.volume = None;
        Ok(())
    }

    fn creat(&self, path: &str, flags: i32, mode: u32) -> io::Result<Box<dyn RemoteFd>> {
        let volume = self.volume()?;
        let mut tree = volume.lock()?;
        let access = AccessMode::from_posix(flags | libc::O_CREAT);
        let (parent, name) = tree.parent_and_name(path, libc::EISDIR)?;

        let ino = match tree.child(parent, &name)? {
            Some(_) if access.exclusive => return Err(errno(libc::EEXIST)),
            Some(ino) => {
                let node = tree.node_mut(ino)?;
                match &mut node.kind {
                    NodeKind::Dir { .. } => return Err(errno(libc::EISDIR)),
                    NodeKind::File(data) => {
                        if access.truncate && access.writable {
                            data.clear();
                            node.touch();
                        }
                    }
                }
                ino
            }
            None => {
                let mode = libc::S_IFREG as u32 | (mode & 0o7777);
                let ino = tree.alloc(NodeKind::File(Vec::new()), mode)?;
                tree.link(parent, name, ino)?;
                ino
            }
        };
        Ok(self.open_fd(volume, &mut tree, ino, access))
    }

    fn open(&self, path: &str, flags: i32) -> io::Result<Box<dyn RemoteFd>> {
        if flags & libc::O_CREAT != 0 {
            return self.creat(path, flags, 0o666);
        }
        let volume = self.volume()?;
        let mut tree = volume.lock()?;
        let access = AccessMode::from_posix(flags);
        let ino = tree.resolve(path)?;
        let node = tree.node_mut(ino)?;
        match &mut node.kind {
            NodeKind::Dir { .. } if access.writable => return Err(errno(libc::EISDIR)),
            NodeKind::Dir { .. } => {}
            NodeKind::File(data) => {
                if access.truncate && access.writable {
                    data.clear();
                    node.touch();
                }
            }
        }
        Ok(self.open_fd(volume, &mut tree, ino, access))
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let (parent, name) = tree.parent_and_name(path, libc::EEXIST)?;
        if tree.child(parent, &name)?.is_some() {
            return Err(errno(libc::EEXIST));
        }
        let ino = tree.alloc(
            NodeKind::Dir {
                parent,
                children: BTreeMap::new(),
            },
            libc::S_IFDIR as u32 | (mode & 0o7777),
        )?;
        tree.link(parent, name, ino)?;
        tree.node_mut(parent)?.nlink += 1;
        tree.node_mut(ino)?.nlink = 2;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let (parent, name) = tree.parent_and_name(path, libc::EBUSY)?;
        let ino = tree.child(parent, &name)?.ok_or_else(|| errno(libc::ENOENT))?;
        match &tree.node(ino)?.kind {
            NodeKind::Dir { children, .. } if children.is_empty() => {}
            NodeKind::Dir { .. } => return Err(errno(libc::ENOTEMPTY)),
            NodeKind::File(_) => return Err(errno(libc::ENOTDIR)),
        }
        tree.unlink_entry(parent, &name, ino)?;
        let parent_node = tree.node_mut(parent)?;
        parent_node.nlink = parent_node.nlink.saturating_sub(1);
        Ok(())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let (parent, name) = tree.parent_and_name(path, libc::EISDIR)?;
        let ino = tree.child(parent, &name)?.ok_or_else(|| errno(libc::ENOENT))?;
        if tree.node(ino)?.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        tree.unlink_entry(parent, &name, ino)
    }

    fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let (old_parent, old_name) = tree.parent_and_name(old, libc::EBUSY)?;
        let (new_parent, new_name) = tree.parent_and_name(new, libc::EBUSY)?;
        let ino = tree.child(old_parent, &old_name)?.ok_or_else(|| errno(libc::ENOENT))?;
        let moving_dir = tree.node(ino)?.is_dir();

        if moving_dir && tree.is_ancestor(ino, new_parent)? {
            return Err(errno(libc::EINVAL));
        }

        if let Some(target) = tree.child(new_parent, &new_name)? {
            if target == ino {
                return Ok(());
            }
            // Some(is_empty) for a directory target
            let target_dir = match &tree.node(target)?.kind {
                NodeKind::Dir { children, .. } => Some(children.is_empty()),
                NodeKind::File(_) => None,
            };
            match (target_dir, moving_dir) {
                (Some(false), true) => return Err(errno(libc::ENOTEMPTY)),
                (Some(true), true) => {
                    tree.unlink_entry(new_parent, &new_name, target)?;
                    let node = tree.node_mut(new_parent)?;
                    node.nlink = node.nlink.saturating_sub(1);
                }
                (Some(_), false) => return Err(errno(libc::EISDIR)),
                (None, true) => return Err(errno(libc::ENOTDIR)),
                (None, false) => tree.unlink_entry(new_parent, &new_name, target)?,
            }
        }

        tree.children_mut(old_parent)?.remove(&old_name);
        tree.children_mut(new_parent)?.insert(new_name, ino);
        if moving_dir && old_parent != new_parent {
            if let NodeKind::Dir { parent, .. } = &mut tree.node_mut(ino)?.kind {
                *parent = new_parent;
            }
            let old = tree.node_mut(old_parent)?;
            old.nlink = old.nlink.saturating_sub(1);
            tree.node_mut(new_parent)?.nlink += 1;
        }
        tree.node_mut(old_parent)?.touch();
        tree.node_mut(new_parent)?.touch();
        tree.node_mut(ino)?.ctime = SystemTime::now();
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let ino = tree.resolve(path)?;
        tree.node_mut(ino)?.chmod(mode);
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let ino = tree.resolve(path)?;
        tree.resize(ino, size)
    }

    fn stat(&self, path: &str) -> io::Result<RawStat> {
        let volume = self.volume()?;
        let tree = volume.lock()?;
        let ino = tree.resolve(path)?;
        tree.stat(volume.fsid, ino)
    }

    fn statvfs(&self, path: &str) -> io::Result<Statvfs> {
        let volume = self.volume()?;
        let tree = volume.lock()?;
        tree.resolve(path)?;
        Ok(tree.statvfs(volume.fsid))
    }

    fn getxattr(&self, path: &str, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        let tree = self.volume()?.lock()?;
        let ino = tree.resolve(path)?;
        tree.node(ino)?.getxattr(name, buf)
    }

    fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let ino = tree.resolve(path)?;
        tree.node_mut(ino)?.setxattr(name, value, flags)
    }

    fn removexattr(&self, path: &str, name: &str) -> io::Result<()> {
        let mut tree = self.volume()?.lock()?;
        let ino = tree.resolve(path)?;
        tree.node_mut(ino)?.removexattr(name)
    }
}

struct MemVolume {
    fsid: u64,
    tree: Mutex<Tree>,
}

impl MemVolume {
    fn new(name: &str, capacity: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self {
            fsid: hasher.finish(),
            tree: Mutex::new(Tree::new(capacity)),
        }
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Tree>> {
        self.tree.lock().map_err(|_| errno(libc::EIO))
    }
}

enum NodeKind {
    File(Vec<u8>),
    Dir {
        parent: u64,
        children: BTreeMap<String, u64>,
    },
}

struct Node {
    kind: NodeKind,
    mode: u32,
    nlink: u64,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    xattrs: BTreeMap<String, Vec<u8>>,
    open_count: u32,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir { .. } => BLOCK_SIZE,
        }
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }

    fn chmod(&mut self, mode: u32) {
        self.mode = (self.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        self.ctime = SystemTime::now();
    }

    fn resize(&mut self, size: usize) -> io::Result<()> {
        match &mut self.kind {
            NodeKind::File(data) => data.resize(size, 0),
            NodeKind::Dir { .. } => return Err(errno(libc::EISDIR)),
        }
        self.touch();
        Ok(())
    }

    fn getxattr(&self, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        check_xattr_name(name)?;
        let value = self.xattrs.get(name).ok_or_else(|| errno(libc::ENODATA))?;
        if buf.is_empty() {
            return Ok(value.len());
        }
        if buf.len() < value.len() {
            return Err(errno(libc::ERANGE));
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn setxattr(&mut self, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        check_xattr_name(name)?;
        if value.len() > XATTR_SIZE_MAX {
            return Err(errno(libc::E2BIG));
        }
        let exists = self.xattrs.contains_key(name);
        if flags & XATTR_CREATE != 0 && exists {
            return Err(errno(libc::EEXIST));
        }
        if flags & XATTR_REPLACE != 0 && !exists {
            return Err(errno(libc::ENODATA));
        }
        self.xattrs.insert(name.to_string(), value.to_vec());
        self.ctime = SystemTime::now();
        Ok(())
    }

    fn removexattr(&mut self, name: &str) -> io::Result<()> {
        check_xattr_name(name)?;
        self.xattrs.remove(name).ok_or_else(|| errno(libc::ENODATA))?;
        self.ctime = SystemTime::now();
        Ok(())
    }
}

fn check_xattr_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(errno(libc::ERANGE));
    }
    if !XATTR_NAMESPACES.iter().any(|ns| name.len() > ns.len() && name.starts_with(ns)) {
        return Err(errno(libc::ENOTSUP));
    }
    Ok(())
}

struct Tree {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    capacity: u64,
}

impl Tree {
    fn new(capacity: u64) -> Self {
        let now = SystemTime::now();
        let root = Node {
            kind: NodeKind::Dir {
                parent: ROOT_INO,
                children: BTreeMap::new(),
            },
            mode: libc::S_IFDIR as u32 | 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: BTreeMap::new(),
            open_count: 0,
        };
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, root);
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
            capacity,
        }
    }

    fn node(&self, ino: u64) -> io::Result<&Node> {
        self.nodes.get(&ino).ok_or_else(|| errno(libc::ESTALE))
    }

    fn node_mut(&mut self, ino: u64) -> io::Result<&mut Node> {
        self.nodes.get_mut(&ino).ok_or_else(|| errno(libc::ESTALE))
    }

    fn children_mut(&mut self, ino: u64) -> io::Result<&mut BTreeMap<String, u64>> {
        match &mut self.node_mut(ino)?.kind {
            NodeKind::Dir { children, .. } => Ok(children),
            NodeKind::File(_) => Err(errno(libc::ENOTDIR)),
        }
    }

    fn child(&self, dir: u64, name: &str) -> io::Result<Option<u64>> {
        match &self.node(dir)?.kind {
            NodeKind::Dir { children, .. } => Ok(children.get(name).copied()),
            NodeKind::File(_) => Err(errno(libc::ENOTDIR)),
        }
    }

    fn lookup(&self, dir: u64, name: &str) -> io::Result<u64> {
        match name {
            "." => match self.node(dir)?.kind {
                NodeKind::Dir { .. } => Ok(dir),
                NodeKind::File(_) => Err(errno(libc::ENOTDIR)),
            },
            ".." => match self.node(dir)?.kind {
                NodeKind::Dir { parent, .. } => Ok(parent),
                NodeKind::File(_) => Err(errno(libc::ENOTDIR)),
            },
            _ => {
                if name.len() > NAME_MAX {
                    return Err(errno(libc::ENAMETOOLONG));
                }
                self.child(dir, name)?.ok_or_else(|| errno(libc::ENOENT))
            }
        }
    }

    fn resolve(&self, path: &str) -> io::Result<u64> {
        if path.is_empty() {
            return Err(errno(libc::ENOENT));
        }
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(ROOT_INO, |dir, name| self.lookup(dir, name))
    }

    /// Directory that holds the last component of `path`, plus that
    /// component. Paths whose last component is the root, `.` or `..` fail
    /// with `on_special`.
    fn parent_and_name(&self, path: &str, on_special: i32) -> io::Result<(u64, String)> {
        if path.is_empty() {
            return Err(errno(libc::ENOENT));
        }
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() || name == "." || name == ".." {
            return Err(errno(on_special));
        }
        if name.len() > NAME_MAX {
            return Err(errno(libc::ENAMETOOLONG));
        }
        let parent = if dir.is_empty() {
            ROOT_INO
        } else {
            self.resolve(dir)?
        };
        if !self.node(parent)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok((parent, name.to_string()))
    }

    fn alloc(&mut self, kind: NodeKind, mode: u32) -> io::Result<u64> {
        if self.nodes.len() as u64 >= MAX_INODES {
            return Err(errno(libc::ENOSPC));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        let now = SystemTime::now();
        self.nodes.insert(
            ino,
            Node {
                kind,
                mode,
                nlink: 1,
                uid: 0,
                gid: 0,
                atime: now,
                mtime: now,
                ctime: now,
                xattrs: BTreeMap::new(),
                open_count: 0,
            },
        );
        Ok(ino)
    }

    fn link(&mut self, parent: u64, name: String, ino: u64) -> io::Result<()> {
        self.children_mut(parent)?.insert(name, ino);
        self.node_mut(parent)?.touch();
        Ok(())
    }

    fn unlink_entry(&mut self, parent: u64, name: &str, ino: u64) -> io::Result<()> {
        self.children_mut(parent)?.remove(name);
        self.node_mut(parent)?.touch();
        let node = self.node_mut(ino)?;
        node.nlink = if node.is_dir() { 0 } else { node.nlink.saturating_sub(1) };
        node.ctime = SystemTime::now();
        self.reap(ino);
        Ok(())
    }

    /// Drop an inode that is neither linked nor open.
    fn reap(&mut self, ino: u64) {
        if let Some(node) = self.nodes.get(&ino) {
            if node.nlink == 0 && node.open_count == 0 {
                self.nodes.remove(&ino);
            }
        }
    }

    fn is_ancestor(&self, ancestor: u64, mut ino: u64) -> io::Result<bool> {
        loop {
            if ino == ancestor {
                return Ok(true);
            }
            match self.node(ino)?.kind {
                NodeKind::Dir { parent, .. } if parent != ino => ino = parent,
                _ => return Ok(false),
            }
        }
    }

    fn stat(&self, fsid: u64, ino: u64) -> io::Result<RawStat> {
        let node = self.node(ino)?;
        let size = node.size();
        let (atime, atime_nsec) = system_time_to_timespec(node.atime);
        let (mtime, mtime_nsec) = system_time_to_timespec(node.mtime);
        let (ctime, ctime_nsec) = system_time_to_timespec(node.ctime);
        Ok(RawStat {
            st_dev: fsid,
            st_ino: ino,
            st_mode: node.mode,
            st_nlink: node.nlink,
            st_uid: node.uid,
            st_gid: node.gid,
            st_rdev: 0,
            st_size: size as i64,
            st_blksize: BLOCK_SIZE as i64,
            st_blocks: size.div_ceil(512) as i64,
            st_atime: atime,
            st_atime_nsec: atime_nsec,
            st_mtime: mtime,
            st_mtime_nsec: mtime_nsec,
            st_ctime: ctime,
            st_ctime_nsec: ctime_nsec,
        })
    }

    fn free_blocks(&self) -> u64 {
        let used: u64 = self
            .nodes
            .values()
            .map(|n| match &n.kind {
                NodeKind::File(data) => (data.len() as u64).div_ceil(BLOCK_SIZE),
                NodeKind::Dir { .. } => 1,
            })
            .sum();
        (self.capacity / BLOCK_SIZE).saturating_sub(used)
    }

    /// Check that file `ino` may grow to `len` bytes and return that length
    /// as an in-memory size.
    fn reserve(&self, ino: u64, len: u64) -> io::Result<usize> {
        if len > MAX_FILE_SIZE {
            return Err(errno(libc::EFBIG));
        }
        let node = self.node(ino)?;
        if node.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        let have = node.size().div_ceil(BLOCK_SIZE);
        let need = len.div_ceil(BLOCK_SIZE);
        if need > have && need - have > self.free_blocks() {
            return Err(errno(libc::ENOSPC));
        }
        usize::try_from(len).map_err(|_| errno(libc::EFBIG))
    }

    fn resize(&mut self, ino: u64, size: u64) -> io::Result<()> {
        let size = self.reserve(ino, size)?;
        self.node_mut(ino)?.resize(size)
    }

    fn statvfs(&self, fsid: u64) -> Statvfs {
        let blocks = self.capacity / BLOCK_SIZE;
        let bfree = self.free_blocks();
        let ffree = MAX_INODES.saturating_sub(self.nodes.len() as u64);
        Statvfs {
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            blocks,
            bfree,
            bavail: bfree,
            files: MAX_INODES,
            ffree,
            favail: ffree,
            fsid,
            flag: 0,
            namemax: NAME_MAX as u64,
        }
    }

    /// Entry of directory `ino` under `cursor`: `.`, `..`, then the
    /// children in name order, each child after the last name returned.
    fn dir_entry(&self, ino: u64, cursor: &DirCursor) -> io::Result<Option<(String, u64)>> {
        let (parent, children) = match &self.node(ino)?.kind {
            NodeKind::Dir { parent, children } => (*parent, children),
            NodeKind::File(_) => return Err(errno(libc::ENOTDIR)),
        };
        Ok(match cursor {
            DirCursor::Dot => Some((".".to_string(), ino)),
            DirCursor::DotDot => Some(("..".to_string(), parent)),
            DirCursor::After(last) => {
                let lower = match last {
                    Some(name) => Bound::Excluded(name.as_str()),
                    None => Bound::Unbounded,
                };
                children
                    .range::<str, _>((lower, Bound::Unbounded))
                    .next()
                    .map(|(name, ino)| (name.clone(), *ino))
            }
        })
    }
}

/// Position of a directory stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum DirCursor {
    #[default]
    Dot,
    DotDot,
    /// Among the children, past the named one (or before the first)
    After(Option<String>),
}

impl DirCursor {
    fn advance(&mut self, name: String) {
        *self = match self {
            DirCursor::Dot => DirCursor::DotDot,
            DirCursor::DotDot => DirCursor::After(None),
            DirCursor::After(_) => DirCursor::After(Some(name)),
        };
    }
}

struct MemFd {
    volume: Arc<MemVolume>,
    connected: Arc<AtomicBool>,
    ino: u64,
    access: AccessMode,
    offset: u64,
    dir_pos: usize,
    cursor: DirCursor,
    closed: bool,
}

impl MemFd {
    fn tree(&self) -> io::Result<MutexGuard<'_, Tree>> {
        if self.closed {
            return Err(errno(libc::EBADF));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(errno(libc::ENOTCONN));
        }
        self.volume.lock()
    }

    fn release(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(errno(libc::EBADF));
        }
        self.closed = true;
        let mut tree = self.volume.lock()?;
        if let Some(node) = tree.nodes.get_mut(&self.ino) {
            node.open_count = node.open_count.saturating_sub(1);
        }
        tree.reap(self.ino);
        Ok(())
    }
}

fn read_at(tree: &mut Tree, ino: u64, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let node = tree.node_mut(ino)?;
    let data = match &node.kind {
        NodeKind::File(data) => data,
        NodeKind::Dir { .. } => return Err(errno(libc::EISDIR)),
    };
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    node.atime = SystemTime::now();
    Ok(n)
}

fn write_at(tree: &mut Tree, ino: u64, buf: &[u8], offset: u64) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or_else(|| errno(libc::EFBIG))?;
    if end > tree.node(ino)?.size() {
        tree.reserve(ino, end)?;
    }
    let start = usize::try_from(offset).map_err(|_| errno(libc::EFBIG))?;
    let end = start.checked_add(buf.len()).ok_or_else(|| errno(libc::EFBIG))?;
    let node = tree.node_mut(ino)?;
    let data = match &mut node.kind {
        NodeKind::File(data) => data,
        NodeKind::Dir { .. } => return Err(errno(libc::EISDIR)),
    };
    if data.len() < end {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(buf);
    node.touch();
    Ok(buf.len())
}

impl RemoteFd for MemFd {
    fn close(&mut self) -> io::Result<()> {
        self.release()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.access.readable {
            return Err(errno(libc::EBADF));
        }
        let mut tree = self.tree()?;
        let n = read_at(&mut tree, self.ino, buf, self.offset)?;
        drop(tree);
        self.offset += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.access.writable {
            return Err(errno(libc::EBADF));
        }
        let mut tree = self.tree()?;
        let offset = if self.access.append {
            tree.node(self.ino)?.size()
        } else {
            self.offset
        };
        let n = write_at(&mut tree, self.ino, buf, offset)?;
        drop(tree);
        self.offset = offset + n as u64;
        Ok(n)
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if !self.access.readable {
            return Err(errno(libc::EBADF));
        }
        let mut tree = self.tree()?;
        read_at(&mut tree, self.ino, buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if !self.access.writable {
            return Err(errno(libc::EBADF));
        }
        let mut tree = self.tree()?;
        write_at(&mut tree, self.ino, buf, offset)
    }

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let tree = self.tree()?;
        let node = tree.node(self.ino)?;
        if node.is_dir() {
            // only rewinding a directory stream is supported
            return match pos {
                SeekFrom::Start(0) => {
                    drop(tree);
                    self.dir_pos = 0;
                    self.cursor = DirCursor::default();
                    Ok(0)
                }
                _ => Err(errno(libc::EINVAL)),
            };
        }
        let base = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.offset.checked_add_signed(d),
            SeekFrom::End(d) => node.size().checked_add_signed(d),
        };
        drop(tree);
        self.offset = base.ok_or_else(|| errno(libc::EINVAL))?;
        Ok(self.offset)
    }

    fn fstat(&self) -> io::Result<RawStat> {
        self.tree()?.stat(self.volume.fsid, self.ino)
    }

    fn fsync(&self) -> io::Result<()> {
        self.tree().map(|_| ())
    }

    fn ftruncate(&self, size: u64) -> io::Result<()> {
        if !self.access.writable {
            return Err(errno(libc::EINVAL));
        }
        let mut tree = self.tree()?;
        tree.resize(self.ino, size)
    }

    fn fchmod(&self, mode: u32) -> io::Result<()> {
        self.tree()?.node_mut(self.ino)?.chmod(mode);
        Ok(())
    }

    fn readdirplus(&mut self) -> io::Result<Option<(RawDirent, RawStat)>> {
        let tree = self.tree()?;
        let Some((name, ino)) = tree.dir_entry(self.ino, &self.cursor)? else {
            return Ok(None);
        };
        let stat = tree.stat(self.volume.fsid, ino)?;
        drop(tree);
        self.dir_pos += 1;
        tracing::trace!("readdir entry {} at {}", name, self.dir_pos);
        let entry = RawDirent::new(
            ino,
            self.dir_pos as i64,
            RawDirent::type_from_mode(stat.st_mode),
            name.as_bytes(),
        );
        self.cursor.advance(name);
        Ok(Some((entry, stat)))
    }

    fn fgetxattr(&self, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        self.tree()?.node(self.ino)?.getxattr(name, buf)
    }

    fn fsetxattr(&self, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        self.tree()?.node_mut(self.ino)?.setxattr(name, value, flags)
    }

    fn fremovexattr(&self, name: &str) -> io::Result<()> {
        self.tree()?.node_mut(self.ino)?.removexattr(name)
    }
}

impl Drop for MemFd {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Box<dyn RemoteSession> {
        let driver = MemDriver::new().export("test");
        let mut session = driver.new_session("test").unwrap();
        session.set_volfile_server("tcp", "localhost", 24007).unwrap();
        session.init().unwrap();
        session
    }

    fn code<T: std::fmt::Debug>(res: io::Result<T>) -> i32 {
        res.unwrap_err().raw_os_error().unwrap()
    }

    #[test]
    fn test_init_requires_server_and_export() {
        let driver = MemDriver::new().export("test");
        let mut session = driver.new_session("test").unwrap();
        assert_eq!(code(session.init()), libc::ENOTCONN);

        let mut other = driver.new_session("other").unwrap();
        other.set_volfile_server("tcp", "localhost", 24007).unwrap();
        assert_eq!(code(other.init()), libc::ENOENT);

        assert_eq!(code(driver.new_session("").map(|_| ())), libc::EINVAL);
        assert_eq!(code(session.set_volfile_server("udp", "localhost", 1)), libc::EINVAL);
    }

    #[test]
    fn test_operations_after_fini() {
        let mut session = session();
        let fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        session.fini().unwrap();
        assert_eq!(code(session.stat("/f")), libc::ENOTCONN);
        assert_eq!(code(fd.fstat()), libc::ENOTCONN);
    }

    #[test]
    fn test_mkdir_errors() {
        let session = session();
        session.mkdir("/d", 0o755).unwrap();
        assert_eq!(code(session.mkdir("/d", 0o755)), libc::EEXIST);
        assert_eq!(code(session.mkdir("/", 0o755)), libc::EEXIST);
        assert_eq!(code(session.mkdir("/x/y", 0o755)), libc::ENOENT);

        drop(session.creat("/f", libc::O_WRONLY, 0o644).unwrap());
        assert_eq!(code(session.mkdir("/f/y", 0o755)), libc::ENOTDIR);

        let long = format!("/{}", "n".repeat(NAME_MAX + 1));
        assert_eq!(code(session.mkdir(&long, 0o755)), libc::ENAMETOOLONG);
    }

    #[test]
    fn test_rmdir_and_unlink() {
        let session = session();
        session.mkdir("/d", 0o755).unwrap();
        session.mkdir("/d/e", 0o755).unwrap();
        assert_eq!(code(session.rmdir("/d")), libc::ENOTEMPTY);
        assert_eq!(code(session.unlink("/d/e")), libc::EISDIR);
        session.rmdir("/d/e").unwrap();
        session.rmdir("/d").unwrap();
        assert_eq!(code(session.stat("/d")), libc::ENOENT);

        drop(session.creat("/f", libc::O_WRONLY, 0o644).unwrap());
        assert_eq!(code(session.rmdir("/f")), libc::ENOTDIR);
        session.unlink("/f").unwrap();
        assert_eq!(code(session.unlink("/f")), libc::ENOENT);
    }

    #[test]
    fn test_open_file_survives_unlink() {
        let session = session();
        let mut fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        fd.write(b"data").unwrap();
        session.unlink("/f").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fd.pread(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"data");
        assert_eq!(fd.fstat().unwrap().st_nlink, 0);
        fd.close().unwrap();
        assert_eq!(code(fd.close()), libc::EBADF);
    }

    #[test]
    fn test_open_flags() {
        let session = session();
        let mut fd = session.creat("/f", libc::O_WRONLY, 0o644).unwrap();
        fd.write(b"hello").unwrap();
        assert_eq!(code(fd.read(&mut [0u8; 1])), libc::EBADF);
        drop(fd);

        let excl = session.creat("/f", libc::O_WRONLY | libc::O_EXCL, 0o644);
        assert_eq!(code(excl.map(|_| ())), libc::EEXIST);

        let mut fd = session.open("/f", libc::O_WRONLY | libc::O_APPEND).unwrap();
        fd.write(b" world").unwrap();
        assert_eq!(fd.fstat().unwrap().st_size, 11);
        drop(fd);

        let fd = session.open("/f", libc::O_RDWR | libc::O_TRUNC).unwrap();
        assert_eq!(fd.fstat().unwrap().st_size, 0);
        drop(fd);

        assert_eq!(code(session.open("/missing", libc::O_RDONLY).map(|_| ())), libc::ENOENT);
        assert_eq!(code(session.open("/", libc::O_RDWR).map(|_| ())), libc::EISDIR);
    }

    #[test]
    fn test_seek_and_sparse_write() {
        let session = session();
        let mut fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        assert_eq!(fd.lseek(SeekFrom::Start(4)).unwrap(), 4);
        fd.write(b"x").unwrap();
        assert_eq!(fd.fstat().unwrap().st_size, 5);
        assert_eq!(fd.lseek(SeekFrom::End(-1)).unwrap(), 4);
        assert_eq!(fd.lseek(SeekFrom::Current(-4)).unwrap(), 0);
        assert_eq!(code(fd.lseek(SeekFrom::Current(-1))), libc::EINVAL);

        let mut buf = [0xffu8; 5];
        fd.read(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, b'x']);
    }

    #[test]
    fn test_rename() {
        let session = session();
        session.mkdir("/a", 0o755).unwrap();
        session.mkdir("/a/b", 0o755).unwrap();
        assert_eq!(code(session.rename("/a", "/a/b/c")), libc::EINVAL);

        drop(session.creat("/f", libc::O_WRONLY, 0o644).unwrap());
        assert_eq!(code(session.rename("/f", "/a")), libc::EISDIR);
        assert_eq!(code(session.rename("/a", "/f")), libc::ENOTDIR);

        session.rename("/a/b", "/b").unwrap();
        assert!(session.stat("/b").unwrap().is_dir());
        assert_eq!(session.stat("/a").unwrap().st_nlink, 2);
        assert_eq!(session.stat("/b/..").unwrap().st_ino, session.stat("/").unwrap().st_ino);
    }

    #[test]
    fn test_readdir_order_and_end() {
        let session = session();
        session.mkdir("/d", 0o755).unwrap();
        session.mkdir("/d/sub", 0o755).unwrap();
        drop(session.creat("/d/file", libc::O_WRONLY, 0o644).unwrap());

        let mut fd = session.open("/d", libc::O_RDONLY).unwrap();
        let mut names = Vec::new();
        while let Some((entry, stat)) = fd.readdirplus().unwrap() {
            let name = crate::dirent::entry_name(&entry);
            assert_eq!(entry.d_type == libc::DT_DIR, stat.is_dir(), "{name}");
            names.push(name);
        }
        assert_eq!(names, [".", "..", "file", "sub"]);
        assert!(fd.readdirplus().unwrap().is_none());

        fd.lseek(SeekFrom::Start(0)).unwrap();
        assert!(fd.readdir().unwrap().is_some());
    }

    #[test]
    fn test_readdir_on_file() {
        let session = session();
        let mut fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        assert_eq!(code(fd.readdirplus()), libc::ENOTDIR);
    }

    #[test]
    fn test_xattrs() {
        let session = session();
        drop(session.creat("/f", libc::O_WRONLY, 0o644).unwrap());

        session.setxattr("/f", "user.k", b"value", 0).unwrap();
        assert_eq!(session.getxattr("/f", "user.k", &mut []).unwrap(), 5);
        assert_eq!(code(session.getxattr("/f", "user.k", &mut [0u8; 2])), libc::ERANGE);
        assert_eq!(code(session.setxattr("/f", "user.k", b"v", XATTR_CREATE)), libc::EEXIST);
        assert_eq!(code(session.setxattr("/f", "user.n", b"v", XATTR_REPLACE)), libc::ENODATA);
        assert_eq!(code(session.setxattr("/f", "bogus.k", b"v", 0)), libc::ENOTSUP);

        session.removexattr("/f", "user.k").unwrap();
        assert_eq!(code(session.getxattr("/f", "user.k", &mut [])), libc::ENODATA);
    }

    #[test]
    fn test_statvfs() {
        let driver = MemDriver::new().export_with_capacity("small", 1 << 20);
        let mut session = driver.new_session("small").unwrap();
        session.set_volfile_server("tcp", "localhost", 24007).unwrap();
        session.init().unwrap();

        let before = session.statvfs("/").unwrap();
        assert_eq!(before.namemax, 255);
        assert_eq!(before.blocks, 256);

        let fd = session.creat("/f", libc::O_WRONLY, 0o644).unwrap();
        fd.pwrite(&[1u8; 8192], 0).unwrap();
        let after = session.statvfs("/").unwrap();
        assert_eq!(before.bfree - after.bfree, 2);
        assert_eq!(code(session.statvfs("/missing")), libc::ENOENT);
    }

    #[test]
    fn test_set_logging_is_recorded() {
        let driver = MemDriver::new().export("test");
        let mut session = driver.new_session("test").unwrap();
        session.set_logging(Path::new("/tmp/test.log"), LogLevel::Debug).unwrap();
        assert_eq!(
            driver.logging("test"),
            Some((PathBuf::from("/tmp/test.log"), LogLevel::Debug))
        );
        assert_eq!(code(session.set_logging(Path::new(""), LogLevel::Info)), libc::EINVAL);
    }

    fn small_session() -> Box<dyn RemoteSession> {
        let driver = MemDriver::new().export_with_capacity("small", 1 << 20);
        let mut session = driver.new_session("small").unwrap();
        session.set_volfile_server("tcp", "localhost", 24007).unwrap();
        session.init().unwrap();
        session
    }

    #[test]
    fn test_write_past_max_file_size() {
        let session = session();
        let mut fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        assert_eq!(code(fd.pwrite(b"x", u64::MAX - 1)), libc::EFBIG);
        assert_eq!(code(fd.pwrite(b"x", MAX_FILE_SIZE)), libc::EFBIG);
        assert_eq!(code(fd.ftruncate(1 << 62)), libc::EFBIG);
        assert_eq!(code(session.truncate("/f", 1 << 62)), libc::EFBIG);

        fd.lseek(SeekFrom::Start(u64::MAX - 1)).unwrap();
        assert_eq!(code(fd.write(b"xy")), libc::EFBIG);
        assert_eq!(fd.write(b"").unwrap(), 0);
        assert_eq!(fd.fstat().unwrap().st_size, 0);
    }

    #[test]
    fn test_write_past_capacity() {
        let session = small_session();
        let fd = session.creat("/f", libc::O_RDWR, 0o644).unwrap();
        assert_eq!(code(fd.pwrite(&[1u8; 4096], 64 << 20)), libc::ENOSPC);
        assert_eq!(code(fd.ftruncate(2 << 20)), libc::ENOSPC);
        assert_eq!(code(session.truncate("/f", 2 << 20)), libc::ENOSPC);
        assert_eq!(fd.fstat().unwrap().st_size, 0);

        // fill what is left, then one more block fails
        let free = session.statvfs("/").unwrap().bfree;
        fd.ftruncate(free * BLOCK_SIZE).unwrap();
        assert_eq!(session.statvfs("/").unwrap().bfree, 0);
        assert_eq!(code(fd.pwrite(b"x", free * BLOCK_SIZE)), libc::ENOSPC);

        // rewriting inside the file and shrinking need no space
        assert_eq!(fd.pwrite(b"x", 0).unwrap(), 1);
        fd.ftruncate(BLOCK_SIZE).unwrap();
        assert_eq!(session.statvfs("/").unwrap().bfree, free - 1);
    }

    #[test]
    fn test_readdir_cursor_survives_changes() {
        let session = session();
        session.mkdir("/d", 0o755).unwrap();
        for name in ["a", "b", "c", "d"] {
            session.creat(&format!("/d/{}", name), libc::O_RDWR, 0o644).unwrap();
        }
        let mut fd = session.open("/d", libc::O_RDONLY).unwrap();
        let mut next = || {
            fd.readdirplus()
                .unwrap()
                .map(|(entry, _)| crate::dirent::entry_name(&entry))
        };
        assert_eq!(next().as_deref(), Some("."));
        assert_eq!(next().as_deref(), Some(".."));
        assert_eq!(next().as_deref(), Some("a"));

        // removing an entry already returned does not skip the next one
        session.unlink("/d/a").unwrap();
        assert_eq!(next().as_deref(), Some("b"));
        // removing the entry after the cursor hides it
        session.unlink("/d/c").unwrap();
        assert_eq!(next().as_deref(), Some("d"));
        assert_eq!(next(), None);
    }
}
