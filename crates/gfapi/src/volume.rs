// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session lifecycle and path-addressed operations

use std::io;
use std::path::Path;
use std::sync::Arc;

use gfapi_logging::LogLevel;
use tracing::{debug, warn};

use crate::config::VolumeConfig;
use crate::dirent::{base_name, FileInfo};
use crate::error::{errno, GlfsError, PathError, Result, XattrOp};
use crate::file::File;
use crate::path;
use crate::transport::{Driver, RemoteSession};
use crate::types::{MountState, OpenFlags, RawStat, Statvfs, DEFAULT_PORT, DEFAULT_TRANSPORT};

/// Permission bits `create` asks for, before the remote umask
const CREATE_MODE: u32 = 0o666;

/// One connection to a remote volume
///
/// ```no_run
/// # fn main() -> gfapi::Result<()> {
/// use std::sync::Arc;
/// use gfapi::{memory::MemDriver, Volume};
///
/// let mut vol = Volume::new(Arc::new(MemDriver::new().export("test")));
/// vol.init("localhost", "test")?;
/// vol.mount()?;
/// vol.mkdir_all("/a/b/c", 0o755)?;
/// vol.unmount()?;
/// # Ok(())
/// # }
/// ```
///
/// Lifecycle methods take `&mut self`; path operations take `&self` and are
/// rejected with [`GlfsError::InvalidState`] unless the volume is mounted.
pub struct Volume {
    driver: Arc<dyn Driver>,
    name: String,
    session: Option<Box<dyn RemoteSession>>,
    state: MountState,
}

impl Volume {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            name: String::new(),
            session: None,
            state: MountState::Uninitialized,
        }
    }

    /// Init, configure logging if requested, and mount in one call.
    pub fn connect(driver: Arc<dyn Driver>, config: &VolumeConfig) -> Result<Self> {
        let mut vol = Volume::new(driver);
        vol.init_with(config)?;
        if let Some(logging) = &config.logging {
            vol.set_logging(logging.resolve_log_path(&config.volume), logging.level())?;
        }
        vol.mount()?;
        Ok(vol)
    }

    /// Volume name given to the last `init`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    /// Allocate a session for `volname` whose volume file is served by
    /// `host` on the default transport and port.
    pub fn init(&mut self, host: &str, volname: &str) -> Result<()> {
        self.init_endpoint(volname, DEFAULT_TRANSPORT, host, DEFAULT_PORT)
    }

    /// Like [`Volume::init`] with the endpoint taken from `config`.
    pub fn init_with(&mut self, config: &VolumeConfig) -> Result<()> {
        config.validate()?;
        self.init_endpoint(&config.volume, &config.transport, &config.host, config.port)
    }

    fn init_endpoint(&mut self, volname: &str, transport: &str, host: &str, port: u16) -> Result<()> {
        match self.state {
            MountState::Uninitialized | MountState::Unmounted => {}
            state => return Err(GlfsError::InvalidState { op: "init", state }),
        }
        debug!("init volume {} via {}:{}:{}", volname, transport, host, port);

        let init_err = |source| GlfsError::Init {
            volume: volname.to_string(),
            source,
        };
        let mut session = self.driver.new_session(volname).map_err(init_err)?;
        session
            .set_volfile_server(transport, host, port)
            .map_err(init_err)?;

        self.name = volname.to_string();
        self.session = Some(session);
        self.state = MountState::Initialized;
        Ok(())
    }

    /// Forward diagnostic settings to the remote library.
    pub fn set_logging(&mut self, path: impl AsRef<Path>, level: LogLevel) -> Result<()> {
        let path = path.as_ref();
        let state = self.state;
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                return Err(GlfsError::InvalidState {
                    op: "set_logging",
                    state,
                })
            }
        };
        debug!("set logging for {} to {} at {}", self.name, path.display(), level);
        session.set_logging(path, level).map_err(|source| GlfsError::Logging {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn mount(&mut self) -> Result<()> {
        let state = self.state;
        let session = match (state, self.session.as_mut()) {
            (MountState::Initialized, Some(session)) => session,
            _ => return Err(GlfsError::InvalidState { op: "mount", state }),
        };
        debug!("mount volume {}", self.name);
        session.init().map_err(|source| GlfsError::Mount {
            volume: self.name.clone(),
            source,
        })?;
        self.state = MountState::Mounted;
        Ok(())
    }

    /// Release the session.
    ///
    /// The session is gone and the volume is `Unmounted` once this returns,
    /// whatever the outcome. A reported failure is advisory: the remote
    /// library does not reliably signal success here.
    pub fn unmount(&mut self) -> Result<()> {
        let state = self.state;
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Err(GlfsError::InvalidState { op: "unmount", state }),
        };
        self.state = MountState::Unmounted;
        debug!("unmount volume {}", self.name);
        session.fini().map_err(|source| {
            warn!("unmount of volume {} reported failure: {}", self.name, source);
            GlfsError::Unmount {
                volume: self.name.clone(),
                source,
            }
        })
    }

    fn session(&self, op: &'static str) -> Result<&dyn RemoteSession> {
        match (&self.session, self.state) {
            (Some(session), MountState::Mounted) => Ok(session.as_ref()),
            (_, state) => Err(GlfsError::InvalidState { op, state }),
        }
    }

    /// Create or truncate `path` for reading and writing.
    pub fn create(&self, path: &str) -> Result<File> {
        let flags = OpenFlags::create_truncate().to_posix();
        debug!("create {}", path);
        let fd = self
            .session("create")?
            .creat(path, flags, CREATE_MODE)
            .map_err(|e| PathError::new("create", path, e))?;
        Ok(File::new(path, fd))
    }

    /// Open `path` read-only.
    pub fn open(&self, path: &str) -> Result<File> {
        debug!("open {}", path);
        let fd = self
            .session("open")?
            .open(path, OpenFlags::read_only().to_posix())
            .map_err(|e| PathError::new("open", path, e))?;
        Ok(File::new(path, fd))
    }

    /// Open `path` with explicit flags; `perm` applies when the flags ask
    /// for creation.
    pub fn open_file(&self, path: &str, flags: &OpenFlags, perm: u32) -> Result<File> {
        let session = self.session("open")?;
        debug!("open {} with {:?}", path, flags);
        let fd = if flags.creates() {
            session.creat(path, flags.to_posix(), perm)
        } else {
            session.open(path, flags.to_posix())
        }
        .map_err(|e| PathError::new("open", path, e))?;
        Ok(File::new(path, fd))
    }

    pub fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        self.session("mkdir")?
            .mkdir(path, perm)
            .map_err(|e| PathError::new("mkdir", path, e).into())
    }

    /// Create `path` and any missing parents.
    ///
    /// Prefixes are walked on the server as written, so `..` is resolved
    /// against what actually exists. Existing directories along the way are
    /// accepted. When a component exists but is not a directory, the error
    /// names that component's cleaned prefix with ENOTDIR. Any other failure
    /// is reported with the cleaned prefix at which it occurred.
    pub fn mkdir_all(&self, path: &str, perm: u32) -> Result<()> {
        let session = self.session("mkdir")?;
        debug!("mkdir_all {}", path);

        for prefix in path::prefixes(path) {
            match session.mkdir(&prefix, perm) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    let stat = session
                        .stat(&prefix)
                        .map_err(|e| PathError::new("mkdir", path::clean(&prefix), e))?;
                    if !stat.is_dir() {
                        return Err(
                            PathError::new("mkdir", path::clean(&prefix), errno(libc::ENOTDIR))
                                .into(),
                        );
                    }
                }
                Err(e) => return Err(PathError::new("mkdir", path::clean(&prefix), e).into()),
            }
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.session("rmdir")?
            .rmdir(path)
            .map_err(|e| PathError::new("rmdir", path, e).into())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.session("unlink")?
            .unlink(path)
            .map_err(|e| PathError::new("unlink", path, e).into())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.session("rename")?
            .rename(old, new)
            .map_err(|source| GlfsError::Link {
                op: "rename",
                old: old.to_string(),
                new: new.to_string(),
                source,
            })
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.session("chmod")?
            .chmod(path, mode)
            .map_err(|e| PathError::new("chmod", path, e).into())
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.session("truncate")?
            .truncate(path, size)
            .map_err(|e| PathError::new("truncate", path, e).into())
    }

    /// Stat `path`; symlinks are followed.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let stat = self.raw_stat(path)?;
        Ok(FileInfo::from_stat(base_name(path), &stat))
    }

    fn raw_stat(&self, path: &str) -> Result<RawStat> {
        self.session("stat")?.stat(path).map_err(|source| GlfsError::Stat {
            path: path.to_string(),
            source,
        })
    }

    pub fn statvfs(&self, path: &str) -> Result<Statvfs> {
        self.session("statvfs")?
            .statvfs(path)
            .map_err(|source| GlfsError::Stat {
                path: path.to_string(),
                source,
            })
    }

    /// Copy attribute `attr` of `path` into `dest` and return its length.
    ///
    /// With an empty `dest` nothing is copied and only the length of the
    /// value is returned.
    pub fn getxattr(&self, path: &str, attr: &str, dest: &mut [u8]) -> Result<usize> {
        let op = if dest.is_empty() {
            XattrOp::Probe
        } else {
            XattrOp::Get
        };
        self.session("getxattr")?
            .getxattr(path, attr, dest)
            .map_err(|e| attr_err(op, path, attr, e))
    }

    pub fn getxattr_vec(&self, path: &str, attr: &str) -> Result<Vec<u8>> {
        let size = self.getxattr(path, attr, &mut [])?;
        let mut value = vec![0u8; size];
        let read = self.getxattr(path, attr, &mut value)?;
        value.truncate(read);
        Ok(value)
    }

    pub fn setxattr(&self, path: &str, attr: &str, data: &[u8], flags: i32) -> Result<()> {
        self.session("setxattr")?
            .setxattr(path, attr, data, flags)
            .map_err(|e| attr_err(XattrOp::Set, path, attr, e))
    }

    pub fn removexattr(&self, path: &str, attr: &str) -> Result<()> {
        self.session("removexattr")?
            .removexattr(path, attr)
            .map_err(|e| attr_err(XattrOp::Remove, path, attr, e))
    }
}

fn attr_err(op: XattrOp, path: &str, attr: &str, source: io::Error) -> GlfsError {
    GlfsError::Attribute {
        op,
        target: path.to_string(),
        attr: attr.to_string(),
        source,
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.session.is_some() {
            // failure is already logged by unmount
            let _ = self.unmount();
        }
    }
}
