// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Directory handles and the non-dot entries they yield.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};
use nix::dir::{Dir, Type};
use nix::sys::stat::SFlag;

use crate::sys;

/// The kind of a directory entry, collapsed to the three cases the weave
/// engine distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Dir,
    Symlink,
    Other,
}

impl Kind {
    pub fn is_dir(self) -> bool {
        matches!(self, Kind::Dir)
    }
}

/// Whether a raw `st_mode` names a directory.
pub fn mode_is_dir(mode: u32) -> bool {
    kind_of_mode(mode).is_dir()
}

fn kind_of_mode(mode: u32) -> Kind {
    let ifmt = SFlag::from_bits_truncate(mode) & SFlag::S_IFMT;
    if ifmt == SFlag::S_IFDIR {
        Kind::Dir
    } else if ifmt == SFlag::S_IFLNK {
        Kind::Symlink
    } else {
        Kind::Other
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: Kind,
}

/// A directory handle: read-only, opened without following a terminal
/// symlink, close-on-exec. Owned by whichever merge frame opens it; released
/// (via `Drop`) when the frame is done with it.
pub struct OpenDir(Dir);

impl OpenDir {
    /// Opens `name` relative to `dirfd`. `dirfd` of `None` resolves relative
    /// to the process cwd.
    pub fn open_at(dirfd: Option<RawFd>, name: &OsStr) -> Result<Self> {
        Ok(Self(sys::open_dir_at(dirfd, name)?))
    }

    /// Opens an absolute or cwd-relative path directly. Used for the two
    /// roots of a weave: the host root and the user-supplied overlay tree.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self(sys::open_dir(path)?))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Lists the entries of this directory, skipping `.` and `..`. Consumes
    /// the kernel readdir cursor: a directory can only be listed once per
    /// handle. A frame that needs a second pass opens a fresh handle with
    /// [`OpenDir::open_at`] rather than rewinding (`nix` exposes no
    /// `rewinddir`).
    pub fn list_entries(&mut self) -> Result<Vec<DirEntry>> {
        let fd = self.0.as_raw_fd();
        let mut entries = Vec::new();
        for item in self.0.iter() {
            let item = item.context("readdir failed")?;
            let name_bytes = item.file_name().to_bytes();
            if name_bytes == b"." || name_bytes == b".." {
                continue;
            }
            let name = OsStr::from_bytes(name_bytes).to_owned();
            let kind = match item.file_type() {
                Some(Type::Directory) => Kind::Dir,
                Some(Type::Symlink) => Kind::Symlink,
                Some(_) => Kind::Other,
                // DT_UNKNOWN: the filesystem didn't report a type in the
                // dirent; fall back to an explicit stat.
                None => {
                    let st = sys::stat_at(fd, &name)?;
                    kind_of_mode(st.st_mode)
                }
            };
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }
}
