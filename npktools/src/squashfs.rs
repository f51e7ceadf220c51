// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key substitution in the root filesystem image
//!
//! We don't parse squashfs ourselves: the image is unpacked and repacked
//! with the usual `squashfs-tools`, and every regular file in between gets
//! the key substitution treatment.

use crate::{
    keys::{KeyPair, KeySet},
    Error,
};
use log::{debug, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use walkdir::WalkDir;

/// A file that was rewritten by [`patch_tree`]
#[derive(Debug, PartialEq, Eq)]
pub struct PatchedFile {
    pub path: PathBuf,
    /// Names of the keys found in the file
    pub keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct TreeReport {
    /// Number of regular files that were read
    pub scanned: usize,
    pub patched: Vec<PatchedFile>,
}

impl TreeReport {
    /// Whether the key named `name` was found in any file
    pub fn contains_key(&self, name: &str) -> bool {
        self.patched.iter().any(|f| f.keys.iter().any(|k| k == name))
    }
}

/// Substitutes keys in every regular file under `root`.
///
/// Files without a match are not written. Symlinks are not followed. The
/// first read or write failure aborts the walk; the tree may then be
/// partially patched and should be thrown away.
pub fn patch_tree(root: &Path, keys: &KeySet) -> Result<TreeReport, Error> {
    let mut report = TreeReport::default();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matched = patch_file(path, keys)?;
        report.scanned += 1;
        if matched.is_empty() {
            continue;
        }
        report.patched.push(PatchedFile {
            path: path.to_owned(),
            keys: matched.iter().map(|p| p.name().to_owned()).collect(),
        });
    }

    info!(
        "patched {} of {} files under {}",
        report.patched.len(),
        report.scanned,
        root.display()
    );
    for pair in keys.pairs() {
        if !report.contains_key(pair.name()) {
            warn!("no file under {} contains key {pair}", root.display());
        }
    }
    Ok(report)
}

/// Substitutes keys in a single file, rewriting it only if something matched
pub fn patch_file<'k>(
    path: &Path,
    keys: &'k KeySet,
) -> Result<Vec<&'k KeyPair>, Error> {
    let mut data = fs::read(path).map_err(|source| Error::FileRead {
        path: path.to_owned(),
        source,
    })?;

    let matched = keys.substitute(&mut data);
    if matched.is_empty() {
        debug!("{}: no keys", path.display());
        return Ok(matched);
    }
    fs::write(path, &data).map_err(|source| Error::FileWrite {
        path: path.to_owned(),
        source,
    })?;
    for pair in &matched {
        info!("{} public key patched: {pair}", path.display());
    }
    Ok(matched)
}

/// How the filesystem image gets unpacked and repacked
#[derive(Clone, Debug)]
pub struct SquashfsOptions {
    pub unsquashfs: PathBuf,
    pub mksquashfs: PathBuf,
    /// Arguments passed to `mksquashfs` after the source and destination
    pub mksquashfs_args: Vec<String>,
    /// Where to create the scratch directory; the system temporary
    /// directory if `None`
    pub scratch_parent: Option<PathBuf>,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            unsquashfs: "unsquashfs".into(),
            mksquashfs: "mksquashfs".into(),
            mksquashfs_args: [
                "-quiet",
                "-comp",
                "xz",
                "-no-xattrs",
                "-b",
                "256k",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            scratch_parent: None,
        }
    }
}

/// Unpacks a filesystem image, patches every file in it and packs it again.
///
/// All intermediate files live in a scratch directory that is removed
/// whether or not this succeeds.
pub fn patch_image(
    image: &[u8],
    keys: &KeySet,
    opts: &SquashfsOptions,
) -> Result<(Vec<u8>, TreeReport), Error> {
    let scratch = match &opts.scratch_parent {
        Some(dir) => tempfile::tempdir_in(dir),
        None => tempfile::tempdir(),
    }
    .map_err(Error::Scratch)?;

    let original = scratch.path().join("squashfs.sfs");
    let root = scratch.path().join("squashfs-root");
    let patched = scratch.path().join("patched.sfs");

    fs::write(&original, image).map_err(|source| Error::FileWrite {
        path: original.clone(),
        source,
    })?;

    info!("extracting {} byte filesystem image", image.len());
    run(Command::new(&opts.unsquashfs)
        .arg("-d")
        .arg(&root)
        .arg(&original))?;

    let report = patch_tree(&root, keys)?;

    info!("packing {}", root.display());
    run(Command::new(&opts.mksquashfs)
        .arg(&root)
        .arg(&patched)
        .args(&opts.mksquashfs_args))?;

    let out = fs::read(&patched).map_err(|source| Error::FileRead {
        path: patched.clone(),
        source,
    })?;
    info!("new filesystem image is {} bytes", out.len());

    scratch.close().map_err(Error::Scratch)?;
    Ok((out, report))
}

/// Runs an external tool to completion, surfacing its stderr
fn run(cmd: &mut Command) -> Result<(), Error> {
    let tool = cmd.get_program().to_string_lossy().into_owned();
    debug!("running {cmd:?}");
    let output = cmd.output().map_err(|source| Error::ToolSpawn {
        tool: tool.clone(),
        source,
    })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !output.status.success() {
        return Err(Error::ExternalTool {
            tool,
            status: output.status,
            stderr,
        });
    }
    if !stderr.is_empty() {
        info!("{tool}: {stderr}");
    }
    Ok(())
}
