// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::{remove_dir_all, set_permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Removes a directory tree like [`std::fs::remove_dir_all`], but first makes
/// every entry read/write/traversable so that directories left behind with
/// restrictive permissions (e.g. by a test fixture) don't block the removal.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    for entry in WalkDir::new(dir).contents_first(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let mode = if entry.file_type().is_dir() {
            0o700
        } else {
            0o600
        };
        set_permissions(entry.path(), PermissionsExt::from_mode(mode)).with_context(|| {
            format!("Failed to chmod {}", entry.path().display())
        })?;
    }
    remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))
}
