// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `overlay <tree> [NAME=VALUE ...] <exe> [args...]` — runs a command inside
//! a bind-mount overlay of `tree` atop the host root.
//!
//! This binary does not use [`cliutil::cli_main`]: the process must stay
//! single-threaded until it has called `unshare(2)`, which happens well
//! before logging is set up, so the usual cliutil startup sequence doesn't
//! apply here.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod cli;
mod namespace;

use cli::{split_env_and_argv, Cli};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let (env, argv) = match split_env_and_argv(cli.rest) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("overlay: {e}");
            return ExitCode::from(1);
        }
    };

    match run(cli.tree, env, argv) {
        Ok(()) => unreachable!("a successful run ends in execvp, which never returns"),
        Err(e) => {
            eprintln!("overlay: FATAL: {e:?}");
            // Base-entry creation conflicts that aren't EEXIST get their own
            // exit code; every other syscall failure falls into the general
            // 255 bucket.
            let code = if e.chain().any(|cause| cause.is::<weave::BaseCreationConflict>()) {
                1
            } else {
                255
            };
            ExitCode::from(code)
        }
    }
}

fn run(tree: PathBuf, env: Vec<(OsString, OsString)>, argv: Vec<OsString>) -> Result<()> {
    let tree = namespace::canonicalize_tree(&tree)?;

    namespace::enter_unprivileged_mount_and_user_namespace()?;
    let (host_root, overlay_tree) = namespace::open_roots(&tree)?;

    let _log_guard = cliutil::LoggingConfig::from_env()?.setup()?;
    tracing::info!(tree = %tree.display(), "entering overlaid root");

    namespace::run_in_overlaid_root(host_root, overlay_tree, &env, &argv)
}
