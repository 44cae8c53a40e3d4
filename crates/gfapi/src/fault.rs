// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy and a transport decorator that applies it

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use gfapi_logging::LogLevel;
use serde::{Deserialize, Serialize};

use crate::error::errno;
use crate::transport::{Driver, RemoteFd, RemoteSession};
use crate::types::{RawDirent, RawStat, Statvfs};

/// Transport calls a rule can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    NewSession,
    SetVolfileServer,
    SetLogging,
    Init,
    Fini,
    Creat,
    Open,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Chmod,
    Truncate,
    Stat,
    Statvfs,
    Getxattr,
    Setxattr,
    Removexattr,
    Close,
    Read,
    Write,
    Pread,
    Pwrite,
    Lseek,
    Fstat,
    Fsync,
    Ftruncate,
    Fchmod,
    Readdir,
    Fgetxattr,
    Fsetxattr,
    Fremovexattr,
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
    Enotconn,
    Eacces,
    Enoent,
    Eexist,
    Enotdir,
    Enodata,
    Erange,
}

impl FaultErrno {
    pub fn raw(self) -> i32 {
        match self {
            FaultErrno::Eio => libc::EIO,
            FaultErrno::Enospc => libc::ENOSPC,
            FaultErrno::Enotconn => libc::ENOTCONN,
            FaultErrno::Eacces => libc::EACCES,
            FaultErrno::Enoent => libc::ENOENT,
            FaultErrno::Eexist => libc::EEXIST,
            FaultErrno::Enotdir => libc::ENOTDIR,
            FaultErrno::Enodata => libc::ENODATA,
            FaultErrno::Erange => libc::ERANGE,
        }
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before failing
    #[serde(default)]
    pub start_after: u64,
    /// Maximum number of injected failures for this rule
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl FaultRule {
    /// Fail every invocation of `op` with `errno`.
    pub fn always(op: FaultOp, errno: FaultErrno) -> Self {
        Self {
            op,
            errno,
            start_after: 0,
            max_faults: None,
        }
    }

    pub fn start_after(mut self, calls: u64) -> Self {
        self.start_after = calls;
        self
    }

    pub fn max_faults(mut self, faults: u64) -> Self {
        self.max_faults = Some(faults);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// An enabled policy with the given rules.
    pub fn with_rules(rules: Vec<FaultRule>) -> Self {
        Self {
            enabled: true,
            rules,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> FaultPolicy {
        self.state().policy.clone()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total failures injected so far across all rules.
    pub fn hits(&self) -> u64 {
        self.state().counters.iter().map(|c| c.hits).sum()
    }

    /// Errno to fail `op` with, if a rule fires for this invocation.
    pub fn should_fault(&self, op: FaultOp) -> Option<i32> {
        let mut guard = self.state();
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counters) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            tracing::debug!("injecting errno {} into {:?}", rule.errno.raw(), op);
            return Some(rule.errno.raw());
        }
        None
    }

    fn check(&self, op: FaultOp) -> io::Result<()> {
        match self.should_fault(op) {
            Some(code) => Err(errno(code)),
            None => Ok(()),
        }
    }
}

/// Decorator over any [`Driver`] whose sessions and handles consult a
/// [`FaultInjector`] before each call
pub struct FaultyDriver {
    inner: Arc<dyn Driver>,
    injector: Arc<FaultInjector>,
}

impl FaultyDriver {
    pub fn new(inner: Arc<dyn Driver>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }
}

impl Driver for FaultyDriver {
    fn new_session(&self, volname: &str) -> io::Result<Box<dyn RemoteSession>> {
        self.injector.check(FaultOp::NewSession)?;
        Ok(Box::new(FaultySession {
            inner: self.inner.new_session(volname)?,
            injector: self.injector.clone(),
        }))
    }
}

struct FaultySession {
    inner: Box<dyn RemoteSession>,
    injector: Arc<FaultInjector>,
}

impl FaultySession {
    fn wrap(&self, fd: Box<dyn RemoteFd>) -> Box<dyn RemoteFd> {
        Box::new(FaultyFd {
            inner: fd,
            injector: self.injector.clone(),
        })
    }
}

impl RemoteSession for FaultySession {
    fn set_volfile_server(&mut self, transport: &str, host: &str, port: u16) -> io::Result<()> {
        self.injector.check(FaultOp::SetVolfileServer)?;
        self.inner.set_volfile_server(transport, host, port)
    }

    fn set_logging(&mut self, path: &Path, level: LogLevel) -> io::Result<()> {
        self.injector.check(FaultOp::SetLogging)?;
        self.inner.set_logging(path, level)
    }

    fn init(&mut self) -> io::Result<()> {
        self.injector.check(FaultOp::Init)?;
        self.inner.init()
    }

    fn fini(&mut self) -> io::Result<()> {
        // the real teardown always runs; only the reported status is faked
        let res = self.inner.fini();
        self.injector.check(FaultOp::Fini)?;
        res
    }

    fn creat(&self, path: &str, flags: i32, mode: u32) -> io::Result<Box<dyn RemoteFd>> {
        self.injector.check(FaultOp::Creat)?;
        Ok(self.wrap(self.inner.creat(path, flags, mode)?))
    }

    fn open(&self, path: &str, flags: i32) -> io::Result<Box<dyn RemoteFd>> {
        self.injector.check(FaultOp::Open)?;
        Ok(self.wrap(self.inner.open(path, flags)?))
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.injector.check(FaultOp::Mkdir)?;
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.injector.check(FaultOp::Rmdir)?;
        self.inner.rmdir(path)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.injector.check(FaultOp::Unlink)?;
        self.inner.unlink(path)
    }

    fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        self.injector.check(FaultOp::Rename)?;
        self.inner.rename(old, new)
    }

    fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        self.injector.check(FaultOp::Chmod)?;
        self.inner.chmod(path, mode)
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        self.injector.check(FaultOp::Truncate)?;
        self.inner.truncate(path, size)
    }

    fn stat(&self, path: &str) -> io::Result<RawStat> {
        self.injector.check(FaultOp::Stat)?;
        self.inner.stat(path)
    }

    fn statvfs(&self, path: &str) -> io::Result<Statvfs> {
        self.injector.check(FaultOp::Statvfs)?;
        self.inner.statvfs(path)
    }

    fn getxattr(&self, path: &str, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        self.injector.check(FaultOp::Getxattr)?;
        self.inner.getxattr(path, name, buf)
    }

    fn setxattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        self.injector.check(FaultOp::Setxattr)?;
        self.inner.setxattr(path, name, value, flags)
    }

    fn removexattr(&self, path: &str, name: &str) -> io::Result<()> {
        self.injector.check(FaultOp::Removexattr)?;
        self.inner.removexattr(path, name)
    }
}

struct FaultyFd {
    inner: Box<dyn RemoteFd>,
    injector: Arc<FaultInjector>,
}

impl RemoteFd for FaultyFd {
    fn close(&mut self) -> io::Result<()> {
        let res = self.inner.close();
        self.injector.check(FaultOp::Close)?;
        res
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.injector.check(FaultOp::Read)?;
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.injector.check(FaultOp::Write)?;
        self.inner.write(buf)
    }

    fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.injector.check(FaultOp::Pread)?;
        self.inner.pread(buf, offset)
    }

    fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.injector.check(FaultOp::Pwrite)?;
        self.inner.pwrite(buf, offset)
    }

    fn lseek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.injector.check(FaultOp::Lseek)?;
        self.inner.lseek(pos)
    }

    fn fstat(&self) -> io::Result<RawStat> {
        self.injector.check(FaultOp::Fstat)?;
        self.inner.fstat()
    }

    fn fsync(&self) -> io::Result<()> {
        self.injector.check(FaultOp::Fsync)?;
        self.inner.fsync()
    }

    fn ftruncate(&self, size: u64) -> io::Result<()> {
        self.injector.check(FaultOp::Ftruncate)?;
        self.inner.ftruncate(size)
    }

    fn fchmod(&self, mode: u32) -> io::Result<()> {
        self.injector.check(FaultOp::Fchmod)?;
        self.inner.fchmod(mode)
    }

    fn readdirplus(&mut self) -> io::Result<Option<(RawDirent, RawStat)>> {
        self.injector.check(FaultOp::Readdir)?;
        self.inner.readdirplus()
    }

    fn readdir(&mut self) -> io::Result<Option<RawDirent>> {
        self.injector.check(FaultOp::Readdir)?;
        self.inner.readdir()
    }

    fn fgetxattr(&self, name: &str, buf: &mut [u8]) -> io::Result<usize> {
        self.injector.check(FaultOp::Fgetxattr)?;
        self.inner.fgetxattr(name, buf)
    }

    fn fsetxattr(&self, name: &str, value: &[u8], flags: i32) -> io::Result<()> {
        self.injector.check(FaultOp::Fsetxattr)?;
        self.inner.fsetxattr(name, value, flags)
    }

    fn fremovexattr(&self, name: &str) -> io::Result<()> {
        self.injector.check(FaultOp::Fremovexattr)?;
        self.inner.fremovexattr(name)
    }
}
