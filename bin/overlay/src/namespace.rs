// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The namespace bootstrap and pivot driver: everything between process
//! start and the `execvp` of the child, collapsed into a single unprivileged
//! process with no fork/wait stage.

use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{execvp, getgid, getuid};
use weave::dirent::OpenDir;
use weave::{merge, OutLoc, Role};

/// Enters a fresh, unprivileged user+mount namespace mapping the caller's
/// own uid/gid identically inside it, so the caller keeps whatever access it
/// already had to the trees it's about to weave.
pub fn enter_unprivileged_mount_and_user_namespace() -> Result<()> {
    let uid = getuid();
    let gid = getgid();

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
        .context("unshare(CLONE_NEWUSER | CLONE_NEWNS) failed")?;

    fs::write("/proc/self/setgroups", "deny").context("writing /proc/self/setgroups")?;
    fs::write("/proc/self/uid_map", format!("{uid} {uid} 1\n"))
        .context("writing /proc/self/uid_map")?;
    fs::write("/proc/self/gid_map", format!("{gid} {gid} 1\n"))
        .context("writing /proc/self/gid_map")?;

    Ok(())
}

/// Weaves `host_root` and `overlay_tree` into a fresh root filesystem and
/// replaces the process image with `argv[0]`, never returning on success.
///
/// `host_root` and `overlay_tree` must be opened before this call, since it
/// tears down and replaces the only root filesystem visible to the process.
pub fn run_in_overlaid_root(
    host_root: OpenDir,
    overlay_tree: OpenDir,
    env: &[(OsString, OsString)],
    argv: &[OsString],
) -> Result<()> {
    let saved_cwd = env::current_dir().context("getcwd failed")?;

    weave::sys::mount_tmpfs(Path::new("/tmp"), "mode=0755").context("mounting scratch tmpfs at /tmp")?;
    fs::create_dir(Path::new("/tmp/newroot")).context("mkdir /tmp/newroot")?;
    fs::create_dir(Path::new("/tmp/oldroot")).context("mkdir /tmp/oldroot")?;
    weave::sys::do_pivot_root(Path::new("/tmp"), Path::new("/tmp/oldroot"))
        .context("pivoting onto scratch tmpfs")?;

    merge(
        host_root,
        overlay_tree,
        OutLoc::Cwd,
        OsStr::new("/newroot"),
        Role::Root,
    )
    .context("weaving overlay tree onto host root")?;

    weave::sys::do_pivot_root(Path::new("/newroot"), Path::new("/newroot"))
        .context("pivoting into the woven root")?;
    weave::sys::umount_detach(Path::new("/")).context("detaching the old root")?;

    env::set_current_dir(&saved_cwd)
        .with_context(|| format!("restoring cwd {}", saved_cwd.display()))?;

    for (name, value) in env {
        env::set_var(name, value);
    }

    exec_child(argv)
}

fn exec_child(argv: &[OsString]) -> Result<()> {
    let exe = to_cstring(&argv[0])?;
    let args = argv
        .iter()
        .map(|a| to_cstring(a))
        .collect::<Result<Vec<_>>>()?;

    execvp(&exe, &args).with_context(|| format!("execvp({:?}) failed", argv[0]))?;
    unreachable!("execvp only returns on error");
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(s.as_bytes()).with_context(|| format!("{:?} contains a NUL byte", s))
}

/// Opens path-only directory handles for the host root and the user-supplied
/// overlay tree, before either is torn down by the pivot dance.
pub fn open_roots(overlay_tree: &Path) -> Result<(OpenDir, OpenDir)> {
    let host_root = OpenDir::open(Path::new("/")).context("opening host root /")?;
    let overlay = OpenDir::open(overlay_tree)
        .with_context(|| format!("opening overlay tree {}", overlay_tree.display()))?;
    Ok((host_root, overlay))
}

pub fn canonicalize_tree(tree: &Path) -> Result<PathBuf> {
    tree.canonicalize()
        .with_context(|| format!("{} does not exist", tree.display()))
}
