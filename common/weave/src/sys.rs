// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin wrappers over the raw Linux syscalls the weave engine issues,
//! each annotated with `anyhow::Context` so a failure names both the
//! syscall and the path involved.

use std::ffi::{OsStr, OsString};
use std::os::fd::RawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{self, openat, AtFlags, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{fchmod, fstatat, mkdirat, mknodat, FileStat, Mode, SFlag};
use nix::unistd::{faccessat, pivot_root, symlinkat, AccessFlags};

/// Opens `name` relative to `dirfd` as a directory handle: read-only, not
/// following a terminal symlink, close-on-exec.
///
/// `dirfd` of `None` resolves `name` relative to the process cwd (`AT_FDCWD`).
pub fn open_dir_at(dirfd: Option<RawFd>, name: &OsStr) -> Result<Dir> {
    Dir::openat(
        dirfd.unwrap_or(nix::libc::AT_FDCWD),
        name,
        OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("openat({:?}, O_DIRECTORY) failed", name))
}

/// Opens `path` as a directory handle.
pub fn open_dir(path: &Path) -> Result<Dir> {
    Dir::open(
        path,
        OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("open({}, O_DIRECTORY) failed", path.display()))
}

/// Opens `name` relative to `dirfd` as a path-only descriptor: never
/// requires traversal permission and never follows a terminal symlink.
/// Used solely to name an object for a subsequent bind mount.
///
/// `dirfd` of `None` resolves `name` relative to the process cwd (`AT_FDCWD`);
/// used only for the top-level `/newroot` target.
pub fn open_path_only_at(dirfd: Option<RawFd>, name: &OsStr) -> Result<RawFd> {
    openat(
        dirfd,
        name,
        OFlag::O_PATH | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("openat({:?}, O_PATH) failed", name))
}

/// `fstatat` without following a terminal symlink.
pub fn stat_at(dirfd: RawFd, name: &OsStr) -> Result<FileStat> {
    fstatat(dirfd, name, AtFlags::AT_SYMLINK_NOFOLLOW)
        .with_context(|| format!("fstatat({:?}) failed", name))
}

pub fn mkdir_at(dirfd: RawFd, name: &OsStr, mode: Mode) -> Result<()> {
    mkdirat(Some(dirfd), name, mode).with_context(|| format!("mkdirat({:?}) failed", name))
}

/// Like [`mkdir_at`], but treats `EEXIST` as success (top already created
/// this entry in pass 1). Returns whether the directory was newly created,
/// so the caller can decide whether to bind the base subtree onto it.
pub fn mkdir_at_or_exists(dirfd: RawFd, name: &OsStr, mode: Mode) -> Result<bool> {
    match mkdirat(Some(dirfd), name, mode) {
        Ok(()) => Ok(true),
        Err(Errno::EEXIST) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("mkdirat({:?}) failed", name)),
    }
}

/// Creates an empty regular file named `name` relative to `dirfd`.
pub fn mknod_regular_at(dirfd: RawFd, name: &OsStr, mode: Mode) -> Result<()> {
    mknodat(Some(dirfd), name, SFlag::S_IFREG, mode, 0)
        .with_context(|| format!("mknodat({:?}) failed", name))
}

/// Like [`mknod_regular_at`], but treats `EEXIST` as success.
pub fn mknod_regular_at_or_exists(dirfd: RawFd, name: &OsStr, mode: Mode) -> Result<bool> {
    match mknodat(Some(dirfd), name, SFlag::S_IFREG, mode, 0) {
        Ok(()) => Ok(true),
        Err(Errno::EEXIST) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("mknodat({:?}) failed", name)),
    }
}

pub fn symlink_at(target: &OsStr, dirfd: RawFd, name: &OsStr) -> Result<()> {
    symlinkat(target, Some(dirfd), name)
        .with_context(|| format!("symlinkat({:?} -> {:?}) failed", name, target))
}

/// Like [`symlink_at`], but treats `EEXIST` as success.
pub fn symlink_at_or_exists(target: &OsStr, dirfd: RawFd, name: &OsStr) -> Result<()> {
    match symlinkat(target, Some(dirfd), name) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("symlinkat({:?} -> {:?}) failed", name, target)),
    }
}

/// Reads the target of the symlink named `name` relative to `dirfd`.
pub fn read_link_at(dirfd: RawFd, name: &OsStr) -> Result<OsString> {
    let mut buf = [0u8; libc_path_max()];
    let target = fcntl::readlinkat(dirfd, name, &mut buf)
        .with_context(|| format!("readlinkat({:?}) failed", name))?;
    Ok(target.to_os_string())
}

const fn libc_path_max() -> usize {
    4096
}

/// `faccessat` for write access, without following a terminal symlink.
pub fn can_write_at(dirfd: RawFd, name: &OsStr) -> bool {
    faccessat(Some(dirfd), name, AccessFlags::W_OK, AtFlags::AT_SYMLINK_NOFOLLOW).is_ok()
}

pub fn fchmod_fd(fd: RawFd, mode: Mode) -> Result<()> {
    fchmod(fd, mode).context("fchmod failed")
}

/// Recursive bind mount: `source` onto `target`.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("mount(bind, {} -> {})", source.display(), target.display()))
}

/// Mounts a fresh tmpfs at `target` with the given directory mode.
pub fn mount_tmpfs(target: &Path, mode_opt: &str) -> Result<()> {
    mount(
        Some(""),
        target,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(mode_opt),
    )
    .with_context(|| format!("mount(tmpfs, {})", target.display()))
}

pub fn umount_detach(target: &Path) -> Result<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .with_context(|| format!("umount2({}, MNT_DETACH)", target.display()))
}

pub fn do_pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    pivot_root(new_root, put_old).with_context(|| {
        format!(
            "pivot_root({}, {})",
            new_root.display(),
            put_old.display()
        )
    })
}
