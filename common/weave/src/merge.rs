// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The recursive tree-merge ("weave") engine: for each (base, top) directory
//! pair, decide whether top can be bind-mounted straight onto base (stack)
//! or whether the directory must be rebuilt from scratch on a fresh tmpfs
//! (explode), and drive the mounts that realize the decision.

use std::ffi::OsStr;
use std::os::fd::RawFd;

use anyhow::{Context, Result};
use nix::sys::stat::Mode;

use crate::bindmount::{bind, PathFd};
use crate::dirent::{DirEntry, Kind, OpenDir};
use crate::sys;

/// What a merge frame's output slot already looks like when `merge` is
/// entered, a join of "did the parent pre-create it?" and "did the parent
/// already bind base onto it?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Topmost invocation: no pre-existing output directory.
    Root,
    /// Recursive call inside a *stacking* parent: the base subtree is
    /// already bound at the output slot; this frame lays down top overrides
    /// only.
    Base,
    /// Recursive call inside an *exploding* parent: the output slot was
    /// `mkdir`'d on the surrounding tmpfs by the parent; base is not
    /// pre-bound.
    Skeleton,
}

/// Tags a base-pass creation error (`mkdirat`/`symlinkat`/`mknodat` during
/// the base pass of an exploded directory) that failed with something other
/// than `EEXIST`. The external interface exits 1 for this category, distinct
/// from the general syscall-failure exit 255 bucket; callers find this
/// marker by walking `anyhow::Error::chain()` rather than matching on a
/// dedicated error enum.
#[derive(Debug)]
pub struct BaseCreationConflict;

impl std::fmt::Display for BaseCreationConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "base-side entry creation conflict")
    }
}

impl std::error::Error for BaseCreationConflict {}

/// Where a merge frame's output entry is created.
#[derive(Clone, Copy, Debug)]
pub enum OutLoc {
    /// The process's current working directory (used only by the top-level
    /// call, whose output name is the absolute path `/newroot`).
    Cwd,
    Fd(RawFd),
}

impl OutLoc {
    fn dirfd(self) -> Option<RawFd> {
        match self {
            OutLoc::Cwd => None,
            OutLoc::Fd(fd) => Some(fd),
        }
    }
}

fn explode_dir_mode() -> Mode {
    Mode::from_bits_truncate(0o755)
}

fn explode_file_mode() -> Mode {
    Mode::from_bits_truncate(0o644)
}

/// Weaves `base` and `top` into an output entry named `out_name` beneath
/// `out`, consuming both directory handles.
pub fn merge(mut base: OpenDir, mut top: OpenDir, out: OutLoc, out_name: &OsStr, role: Role) -> Result<()> {
    let _span = tracing::debug_span!(
        "merge",
        out_name = %out_name.to_string_lossy(),
        role = ?role
    )
    .entered();

    let top_entries = top
        .list_entries()
        .with_context(|| format!("listing {:?}", out_name))?;

    let can_stack = top_entries.iter().all(|e| {
        sys::stat_at(base.as_raw_fd(), &e.name)
            .map(|st| e.kind.is_dir() == crate::dirent::mode_is_dir(st.st_mode))
            .unwrap_or(false)
    });

    if can_stack {
        tracing::info!(out_name = %out_name.to_string_lossy(), "stacking");
        stack(base, top, top_entries, out, out_name, role)
    } else {
        tracing::info!(out_name = %out_name.to_string_lossy(), "exploding");
        explode(base, top, top_entries, out, out_name, role)
    }
}

/// The stack path: one bind of the entire base subtree, then one bind (or
/// recursive merge) per top entry.
fn stack(
    base: OpenDir,
    top: OpenDir,
    top_entries: Vec<DirEntry>,
    out: OutLoc,
    out_name: &OsStr,
    role: Role,
) -> Result<()> {
    if role != Role::Base {
        bind(Some(base.as_raw_fd()), OsStr::new("."), out.dirfd(), out_name)
            .with_context(|| format!("binding base onto {:?}", out_name))?;
    }

    let out_dir = OpenDir::open_at(out.dirfd(), out_name)
        .with_context(|| format!("opening {:?} after stacking base", out_name))?;

    for e in &top_entries {
        if e.kind == Kind::Dir {
            let child_base = OpenDir::open_at(Some(base.as_raw_fd()), &e.name)
                .with_context(|| format!("opening base/{:?}", e.name))?;
            let child_top = OpenDir::open_at(Some(top.as_raw_fd()), &e.name)
                .with_context(|| format!("opening top/{:?}", e.name))?;
            merge(
                child_base,
                child_top,
                OutLoc::Fd(out_dir.as_raw_fd()),
                &e.name,
                Role::Base,
            )?;
        } else {
            bind(
                Some(top.as_raw_fd()),
                &e.name,
                Some(out_dir.as_raw_fd()),
                &e.name,
            )
            .with_context(|| format!("binding top/{:?}", e.name))?;
        }
    }

    Ok(())
}

/// The explode path: a fresh tmpfs, reconstituted entry by entry across two
/// passes (top first, so it wins on any name collision with base).
fn explode(
    mut base: OpenDir,
    top: OpenDir,
    top_entries: Vec<DirEntry>,
    out: OutLoc,
    out_name: &OsStr,
    role: Role,
) -> Result<()> {
    if role != Role::Skeleton {
        let target = PathFd::open_at(out.dirfd(), out_name)
            .with_context(|| format!("resolving explode target {:?}", out_name))?;
        sys::mount_tmpfs(&target.proc_path(), "mode=0755")
            .with_context(|| format!("mounting tmpfs at {:?}", out_name))?;
    }

    let out_dir = OpenDir::open_at(out.dirfd(), out_name)
        .with_context(|| format!("opening {:?} after exploding", out_name))?;

    // Pass 1: top entries. Directories that also exist as a directory in
    // base are mkdir'd as skeletons and recursed into; everything else is
    // materialized and bound straight from top.
    for e in &top_entries {
        match e.kind {
            Kind::Dir => {
                sys::mkdir_at(out_dir.as_raw_fd(), &e.name, explode_dir_mode())
                    .with_context(|| format!("mkdir top-side {:?}", e.name))?;
                let base_has_dir = sys::stat_at(base.as_raw_fd(), &e.name)
                    .map(|st| crate::dirent::mode_is_dir(st.st_mode))
                    .unwrap_or(false);
                if base_has_dir {
                    let child_base = OpenDir::open_at(Some(base.as_raw_fd()), &e.name)
                        .with_context(|| format!("opening base/{:?}", e.name))?;
                    let child_top = OpenDir::open_at(Some(top.as_raw_fd()), &e.name)
                        .with_context(|| format!("opening top/{:?}", e.name))?;
                    merge(
                        child_base,
                        child_top,
                        OutLoc::Fd(out_dir.as_raw_fd()),
                        &e.name,
                        Role::Skeleton,
                    )?;
                } else {
                    bind(
                        Some(top.as_raw_fd()),
                        &e.name,
                        Some(out_dir.as_raw_fd()),
                        &e.name,
                    )
                    .with_context(|| format!("binding top-only dir {:?}", e.name))?;
                }
            }
            Kind::Symlink => {
                let target = sys::read_link_at(top.as_raw_fd(), &e.name)
                    .with_context(|| format!("reading top symlink {:?}", e.name))?;
                sys::symlink_at(&target, out_dir.as_raw_fd(), &e.name)
                    .with_context(|| format!("creating symlink {:?}", e.name))?;
            }
            Kind::Other => {
                sys::mknod_regular_at(out_dir.as_raw_fd(), &e.name, explode_file_mode())
                    .with_context(|| format!("creating placeholder {:?}", e.name))?;
                bind(
                    Some(top.as_raw_fd()),
                    &e.name,
                    Some(out_dir.as_raw_fd()),
                    &e.name,
                )
                .with_context(|| format!("binding top/{:?}", e.name))?;
            }
        }
    }

    // Pass 2: base entries. "Already exists" means top created this name in
    // pass 1 and wins; every other error is fatal.
    let base_entries = base
        .list_entries()
        .with_context(|| format!("listing base side of {:?}", out_name))?;
    for e in &base_entries {
        match e.kind {
            Kind::Dir => {
                let created =
                    sys::mkdir_at_or_exists(out_dir.as_raw_fd(), &e.name, explode_dir_mode())
                        .with_context(|| format!("mkdir base-side {:?}", e.name))
                        .map_err(|err| err.context(BaseCreationConflict))?;
                if created {
                    bind(
                        Some(base.as_raw_fd()),
                        &e.name,
                        Some(out_dir.as_raw_fd()),
                        &e.name,
                    )
                    .with_context(|| format!("binding base-only dir {:?}", e.name))?;
                }
            }
            Kind::Symlink => {
                let target = sys::read_link_at(base.as_raw_fd(), &e.name)
                    .with_context(|| format!("reading base symlink {:?}", e.name))?;
                sys::symlink_at_or_exists(&target, out_dir.as_raw_fd(), &e.name)
                    .with_context(|| format!("creating symlink {:?}", e.name))
                    .map_err(|err| err.context(BaseCreationConflict))?;
            }
            Kind::Other => {
                let created = sys::mknod_regular_at_or_exists(
                    out_dir.as_raw_fd(),
                    &e.name,
                    explode_file_mode(),
                )
                .with_context(|| format!("creating placeholder {:?}", e.name))
                .map_err(|err| err.context(BaseCreationConflict))?;
                if created {
                    bind(
                        Some(base.as_raw_fd()),
                        &e.name,
                        Some(out_dir.as_raw_fd()),
                        &e.name,
                    )
                    .with_context(|| format!("binding base/{:?}", e.name))?;
                }
            }
        }
    }

    let writable = sys::can_write_at(base.as_raw_fd(), OsStr::new("."));
    let mode = if writable {
        Mode::from_bits_truncate(0o1777)
    } else {
        Mode::from_bits_truncate(0o555)
    };
    sys::fchmod_fd(out_dir.as_raw_fd(), mode)
        .with_context(|| format!("chmod {:?}", out_name))?;

    Ok(())
}
