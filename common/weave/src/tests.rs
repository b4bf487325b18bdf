// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises [`crate::merge`] against synthetic base/top trees and inspects
//! the resulting mounted view, issuing real `mount(2)`/namespace syscalls
//! inside a throwaway namespace rather than mocking them.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Result;
use fileutil::SafeTempDir;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid};

use crate::dirent::OpenDir;
use crate::merge::{merge, OutLoc, Role};

/// Enters a fresh unprivileged user+mount namespace, the same dance
/// `overlay`'s own namespace bootstrap performs, so each test can issue real
/// `mount(2)` calls without root and without disturbing other tests.
fn enter_test_namespace() -> Result<()> {
    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)?;
    fs::write("/proc/self/setgroups", "deny")?;
    fs::write("/proc/self/uid_map", format!("{uid} {uid} 1\n"))?;
    fs::write("/proc/self/gid_map", format!("{gid} {gid} 1\n"))?;
    Ok(())
}

/// Weaves `base` atop `top` into a freshly created, empty output directory
/// and returns its path.
fn weave(base: &Path, top: &Path, scratch: &Path) -> Result<PathBuf> {
    let out = scratch.join("out");
    fs::create_dir(&out)?;

    let base_dir = OpenDir::open(base)?;
    let top_dir = OpenDir::open(top)?;
    let out_name = out.as_os_str().to_owned();
    merge(base_dir, top_dir, OutLoc::Cwd, &out_name, Role::Root)?;
    Ok(out)
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("reading {}: {}", path.display(), e))
}

/// S1: top wins on a plain file collision; the containing directory stacks.
#[test]
fn file_collision_top_wins_by_stacking() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("etc"))?;
    fs::create_dir_all(top.join("etc"))?;
    fs::write(base.join("etc/hosts"), "A")?;
    fs::write(top.join("etc/hosts"), "B")?;

    let out = weave(&base, &top, scratch)?;
    assert_eq!(read(&out.join("etc/hosts")), "B");

    Ok(())
}

/// S2: top-only and base-only entries both survive; the root explodes
/// because `/opt` exists only in top.
#[test]
fn top_only_and_base_only_entries_both_survive() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("usr/bin"))?;
    fs::write(base.join("usr/bin/ls"), "base-ls")?;
    fs::create_dir_all(top.join("opt/app"))?;
    fs::write(top.join("opt/app/run"), "top-run")?;

    let out = weave(&base, &top, scratch)?;
    assert_eq!(read(&out.join("usr/bin/ls")), "base-ls");
    assert_eq!(read(&out.join("opt/app/run")), "top-run");

    Ok(())
}

/// S3: a directory/symlink kind mismatch forces explode, and top's symlink
/// wins outright.
#[test]
fn kind_mismatch_triggers_explode_and_top_wins() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("var"))?;
    fs::write(base.join("var/marker"), "base-var")?;
    fs::create_dir_all(&top)?;
    symlink("/data", top.join("var"))?;

    let out = weave(&base, &top, scratch)?;
    let link = fs::symlink_metadata(out.join("var"))?;
    assert!(link.file_type().is_symlink());
    assert_eq!(fs::read_link(out.join("var"))?, Path::new("/data"));

    Ok(())
}

/// S4: a directory present in both stacks; the top-only file inside it wins
/// while the base-only sibling is still visible.
#[test]
fn stacked_directory_exposes_both_sides() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("lib"))?;
    fs::write(base.join("lib/x"), "B")?;
    fs::write(base.join("lib/y"), "Y")?;
    fs::create_dir_all(top.join("lib"))?;
    fs::write(top.join("lib/x"), "X")?;

    let out = weave(&base, &top, scratch)?;
    assert_eq!(read(&out.join("lib/x")), "X");
    assert_eq!(read(&out.join("lib/y")), "Y");

    Ok(())
}

/// S5: a top-side symlink shadowing a base-side file of the same name, with
/// both sides exploded into the same directory.
#[test]
fn symlink_fidelity_during_explode() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("bin"))?;
    fs::write(base.join("bin/sh"), "base-sh")?;
    fs::write(base.join("bin/dash"), "base-dash")?;
    fs::create_dir_all(top.join("bin"))?;
    symlink("/bin/dash", top.join("bin/sh"))?;
    // Make the root itself explode by adding a top-only entry.
    fs::write(top.join("marker"), "top-marker")?;

    let out = weave(&base, &top, scratch)?;
    let meta = fs::symlink_metadata(out.join("bin/sh"))?;
    assert!(meta.file_type().is_symlink());
    assert_eq!(fs::read_link(out.join("bin/sh"))?, Path::new("/bin/dash"));
    assert_eq!(read(&out.join("bin/dash")), "base-dash");

    Ok(())
}

/// Property: writing under a purely-bound base subtree affects the host
/// filesystem (no copy-up), while writing under an exploded tmpfs region
/// does not.
#[test]
fn write_through_only_happens_under_pure_binds() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(base.join("etc"))?;
    fs::write(base.join("etc/hosts"), "A")?;
    fs::create_dir_all(&top)?;
    // Top-only entry at the root forces the root to explode, while /etc
    // (identical on both sides apart from being base-only) stays a pure bind.
    fs::write(top.join("marker"), "m")?;

    let out = weave(&base, &top, scratch)?;

    fs::write(out.join("etc/hosts"), "C")?;
    assert_eq!(read(&base.join("etc/hosts")), "C");

    Ok(())
}

/// Property: the final root directory's mode reflects whether the base
/// directory was writable.
#[test]
fn root_mode_matches_base_writability() -> Result<()> {
    enter_test_namespace()?;
    let scratch = SafeTempDir::new()?;
    let scratch = scratch.path();

    let base = scratch.join("base");
    let top = scratch.join("top");
    fs::create_dir_all(&base)?;
    fs::create_dir_all(&top)?;
    fs::write(top.join("marker"), "m")?;
    fs::set_permissions(&base, PermissionsExt::from_mode(0o555))?;

    let out = weave(&base, &top, scratch)?;
    let mode = fs::metadata(&out)?.permissions().mode() & 0o7777;
    assert_eq!(mode, 0o555);

    Ok(())
}
