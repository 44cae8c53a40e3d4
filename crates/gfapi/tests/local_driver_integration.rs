// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session tests against volumes backed by a host directory

#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::Arc;

use gfapi::local::LocalDriver;
use gfapi::{GlfsError, MountState, Volume};
use tempfile::TempDir;

const DATA: &[u8] = b"data";

fn mount_brick() -> anyhow::Result<(TempDir, Volume)> {
    let brick = TempDir::new()?;
    let driver = LocalDriver::new().export("brick", brick.path());
    let mut vol = Volume::new(Arc::new(driver));
    vol.init("localhost", "brick")?;
    vol.mount()?;
    Ok((brick, vol))
}

#[test]
fn test_operations_land_in_brick() -> anyhow::Result<()> {
    let (brick, vol) = mount_brick()?;
    vol.mkdir_all("/a/b/./c", 0o755)?;
    assert!(brick.path().join("a/b/c").is_dir());

    let mut f = vol.create("/a/b/c/file")?;
    f.write_all(DATA)?;
    f.close()?;
    assert_eq!(std::fs::read(brick.path().join("a/b/c/file"))?, DATA);

    vol.rename("/a/b/c/file", "/a/moved")?;
    assert!(brick.path().join("a/moved").is_file());
    assert_eq!(vol.stat("/a/moved")?.size(), DATA.len() as u64);

    vol.unlink("/a/moved")?;
    vol.rmdir("/a/b/c")?;
    assert!(!brick.path().join("a/b/c").exists());
    Ok(())
}

#[test]
fn test_paths_cannot_escape_brick() -> anyhow::Result<()> {
    let (brick, vol) = mount_brick()?;
    vol.mkdir("/../../escaped", 0o755)?;
    assert!(brick.path().join("escaped").is_dir());
    Ok(())
}

#[test]
fn test_mkdir_all_over_file() -> anyhow::Result<()> {
    let (_brick, vol) = mount_brick()?;
    vol.mkdir_all("/tmp/dir", 0o755)?;
    vol.create("/tmp/dir/file")?.close()?;

    let err = vol.mkdir_all("/tmp/dir/file/subdir", 0o755).unwrap_err();
    let perr = err.as_path_error().expect("path error");
    assert_eq!(perr.path, "/tmp/dir/file");
    assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    Ok(())
}

#[test]
fn test_readdir_over_brick() -> anyhow::Result<()> {
    let (_brick, vol) = mount_brick()?;
    vol.mkdir("/rd", 0o755)?;
    vol.mkdir("/rd/dir", 0o700)?;
    let mut f = vol.create("/rd/file")?;
    f.write(DATA)?;
    assert!(matches!(f.readdir(0), Err(GlfsError::NotDirectory { .. })));
    f.close()?;

    let mut d = vol.open("/rd")?;
    let info = d.readdir(0)?;
    assert_eq!(info.len(), 4);
    let file = info.iter().find(|i| i.name() == "file").expect("file entry");
    assert_eq!(file.size(), DATA.len() as u64);
    let dir = info.iter().find(|i| i.name() == "dir").expect("dir entry");
    assert!(dir.is_dir());
    assert_eq!(dir.mode().perm().bits(), 0o700);

    // exhausted until rewound
    assert!(d.readdir(0)?.is_empty());
    d.seek(std::io::SeekFrom::Start(0))?;
    let mut names = d.readdirnames(0)?;
    names.sort();
    assert_eq!(names, [".", "..", "dir", "file"]);
    Ok(())
}

#[test]
fn test_read_back_and_statvfs() -> anyhow::Result<()> {
    let (_brick, vol) = mount_brick()?;
    let mut f = vol.create("/notes")?;
    f.write_string("hello brick")?;
    f.close()?;

    let mut text = String::new();
    vol.open("/notes")?.read_to_string(&mut text)?;
    assert_eq!(text, "hello brick");

    vol.chmod("/notes", 0o600)?;
    assert_eq!(vol.stat("/notes")?.mode().perm().bits(), 0o600);

    let vbuf = vol.statvfs("/")?;
    assert!(vbuf.namemax > 0);
    assert!(vbuf.bsize > 0);
    Ok(())
}

#[test]
fn test_unknown_volume_fails_mount() -> anyhow::Result<()> {
    let brick = TempDir::new()?;
    let driver = LocalDriver::new().export("brick", brick.path());
    let mut vol = Volume::new(Arc::new(driver));
    vol.init("localhost", "other")?;
    assert!(matches!(vol.mount(), Err(GlfsError::Mount { .. })));
    assert_eq!(vol.state(), MountState::Initialized);
    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn test_user_xattrs() -> anyhow::Result<()> {
    let (_brick, vol) = mount_brick()?;
    let f = vol.create("/x")?;
    match f.setxattr("user.glusterfs", b"Gluster is awesome!", 0) {
        Ok(()) => {}
        // some tmp filesystems have no user xattrs
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    assert_eq!(f.getxattr_vec("user.glusterfs")?, b"Gluster is awesome!");
    assert_eq!(vol.getxattr_vec("/x", "user.glusterfs")?, b"Gluster is awesome!");

    vol.removexattr("/x", "user.glusterfs")?;
    let err = f.getxattr("user.glusterfs", &mut []).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
    Ok(())
}
