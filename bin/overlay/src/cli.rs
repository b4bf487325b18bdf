// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Argument parsing. `clap` owns the `tree` positional and the `--help`
//! surface; the `NAME=VALUE` / child-argv split is hand-rolled because its
//! semantics (pass the child's argv through byte-for-byte, including
//! flag-shaped tokens) can't be expressed as a `clap` grammar.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Runs a command inside a bind-mount overlay of a directory tree atop the
/// host root.
#[derive(Parser, Debug)]
#[command(name = "overlay", trailing_var_arg = true)]
pub struct Cli {
    /// Directory tree to overlay atop the host root.
    pub tree: PathBuf,

    /// `NAME=VALUE` environment bindings, then the child's exe and args.
    #[arg(allow_hyphen_values = true)]
    pub rest: Vec<OsString>,
}

/// Splits `rest` into the leading run of `NAME=VALUE` tokens and the child's
/// argv, per the grammar `[NAME=VALUE ...] <exe> [args...]`: every token is
/// consumed as an environment binding as long as it contains `=`; the first
/// token without one, and everything after it, is the child's argv verbatim.
pub fn split_env_and_argv(rest: Vec<OsString>) -> Result<(Vec<(OsString, OsString)>, Vec<OsString>)> {
    let mut iter = rest.into_iter().peekable();
    let mut env = Vec::new();

    while let Some(tok) = iter.peek() {
        match split_assignment(tok) {
            Some((name, value)) => {
                env.push((name, value));
                iter.next();
            }
            None => break,
        }
    }

    let argv: Vec<OsString> = iter.collect();
    if argv.is_empty() {
        bail!("usage: overlay <tree> [NAME=VALUE ...] <exe> [args...]");
    }
    Ok((env, argv))
}

fn split_assignment(tok: &OsStr) -> Option<(OsString, OsString)> {
    let bytes = tok.as_bytes();
    let pos = bytes.iter().position(|&b| b == b'=')?;
    let name = OsStr::from_bytes(&bytes[..pos]).to_owned();
    let value = OsStr::from_bytes(&bytes[pos + 1..]).to_owned();
    Some((name, value))
}
