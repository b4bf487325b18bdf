// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The bind-mount-by-fd primitive: binds one directory-relative name onto
//! another without ever following a terminal symlink and without requiring
//! read access to either side.

use std::ffi::OsStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::sys;

/// A transient `O_PATH` descriptor, named as `/proc/self/fd/<n>` so it can
/// stand in for an object `mount(2)` would otherwise need a real path for —
/// including symlinks, which `mount(2)` can't be pointed at directly.
///
/// Must stay alive until the `mount()` call that consumes its path string
/// returns; dropped (closed) immediately after via ordinary `Drop`.
pub struct PathFd(OwnedFd);

impl PathFd {
    /// Opens `name` relative to `dirfd` (or the process cwd if `None`) as a
    /// path-only descriptor.
    pub fn open_at(dirfd: Option<RawFd>, name: &OsStr) -> Result<Self> {
        let fd = sys::open_path_only_at(dirfd, name)?;
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// The `/proc/self/fd/<n>` path naming the object this descriptor points
    /// at, for use as a `mount(2)` source or target.
    pub fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", self.0.as_raw_fd()))
    }
}

/// Binds the object named `srcname` under `srcdir` onto the object named
/// `dstname` under `dstdir`, recursively (`MS_BIND | MS_REC`). Neither side
/// is followed if it's a symlink: a symlink source binds as a symlink, and a
/// symlink target is replaced in place rather than traversed through.
///
/// `srcname = "."` binds the directory `srcdir` itself, reusing the same
/// code path as binding a single entry.
pub fn bind(
    srcdir: Option<RawFd>,
    srcname: &OsStr,
    dstdir: Option<RawFd>,
    dstname: &OsStr,
) -> Result<()> {
    let src = PathFd::open_at(srcdir, srcname)
        .with_context(|| format!("opening bind source {:?}", srcname))?;
    let dst = PathFd::open_at(dstdir, dstname)
        .with_context(|| format!("opening bind target {:?}", dstname))?;
    sys::bind_mount(&src.proc_path(), &dst.proc_path())
        .with_context(|| format!("binding {:?} onto {:?}", srcname, dstname))
}
