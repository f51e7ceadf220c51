// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tools for swapping the public keys embedded in a RouterOS-style system
//! package: the kernel container (`BOOTX64.EFI`) and the root filesystem
//! image both carry copies of the vendor's verification keys.

use std::{ops::Range, path::PathBuf, process::ExitStatus};
use thiserror::Error;

pub mod cpio;
pub mod header;
pub mod kernel;
pub mod keys;
pub mod package;
pub mod squashfs;
pub mod xz;

pub use header::PayloadDescriptor;
pub use kernel::{KernelPatch, KernelReport};
pub use keys::{KeyPair, KeySet};
pub use package::{
    patch_package, FileContainer, Package, PackageOptions, PackageReport,
    PartId, SigningKeys,
};
pub use squashfs::{SquashfsOptions, TreeReport};

/// Broad classification of an [`Error`], used when reporting failures to
/// the operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Integrity,
    BudgetExceeded,
    ExternalTool,
    Io,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Format => "FormatError",
            Self::Integrity => "IntegrityError",
            Self::BudgetExceeded => "BudgetExceeded",
            Self::ExternalTool => "ExternalToolError",
            Self::Io => "IOError",
            Self::Config => "ConfigError",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "header field at offset {offset} is out of bounds \
         (image is {len} bytes)"
    )]
    HeaderOutOfBounds { offset: usize, len: usize },

    #[error(
        "payload range {range:?} is out of bounds (image is {len} bytes)"
    )]
    PayloadOutOfBounds { range: Range<usize>, len: usize },

    #[error("payload length field {0} is too short to hold the size trailer")]
    PayloadTooShort(u32),

    #[error("could not decompress payload")]
    Decompress(#[source] std::io::Error),

    #[error("could not configure xz stream")]
    XzStream(#[from] xz2::stream::Error),

    #[error("could not compress payload")]
    Compress(#[source] std::io::Error),

    #[error("could not find cpio header magic {magic:02x?}")]
    MissingArchiveStart { magic: &'static [u8] },

    #[error(
        "could not find cpio trailer {trailer:02x?} after offset {start:#x}"
    )]
    MissingArchiveTrailer {
        trailer: &'static [u8],
        start: usize,
    },

    #[error("could not find kernel entry {0:?} in file container")]
    MissingKernelEntry(String),

    #[error("package has no {0:?} part")]
    MissingPart(PartId),

    #[error("could not decode file container")]
    FileContainer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(
        "decompressed payload is {actual} bytes, \
         but the size trailer says {expected}"
    )]
    SizeMismatch { expected: u32, actual: usize },

    #[error(
        "recompressed payload is {actual} bytes, but only {budget} bytes \
         are reserved for it"
    )]
    BudgetExceeded { budget: usize, actual: usize },

    #[error("{tool} failed ({status}): {stderr}")]
    ExternalTool {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("could not run {tool}")]
    ToolSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not read {}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write {}", .path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not walk directory tree")]
    Walk(#[from] walkdir::Error),

    #[error("could not create scratch directory")]
    Scratch(#[source] std::io::Error),

    #[error("key {name:?} is not valid hex")]
    KeyHex {
        name: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("key {name:?} is empty")]
    EmptyKey { name: String },

    #[error(
        "key {name:?}: old key is {old} bytes but new key is {new} bytes"
    )]
    KeyLengthMismatch { name: String, old: usize, new: usize },

    #[error("new key {new:?} contains old key {old:?}")]
    KeyOverlap { new: String, old: String },

    #[error("could not parse key file")]
    KeyFile(#[from] toml::de::Error),

    #[error("signing failed")]
    Sign(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::HeaderOutOfBounds { .. }
            | Error::PayloadOutOfBounds { .. }
            | Error::PayloadTooShort(..)
            | Error::Decompress(..)
            | Error::MissingArchiveStart { .. }
            | Error::MissingArchiveTrailer { .. }
            | Error::MissingKernelEntry(..)
            | Error::MissingPart(..)
            | Error::FileContainer(..) => ErrorKind::Format,
            Error::SizeMismatch { .. } => ErrorKind::Integrity,
            Error::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Error::ExternalTool { .. } | Error::ToolSpawn { .. } => {
                ErrorKind::ExternalTool
            }
            Error::XzStream(..)
            | Error::Compress(..)
            | Error::FileRead { .. }
            | Error::FileWrite { .. }
            | Error::Walk(..)
            | Error::Scratch(..)
            | Error::Sign(..) => ErrorKind::Io,
            Error::KeyHex { .. }
            | Error::EmptyKey { .. }
            | Error::KeyLengthMismatch { .. }
            | Error::KeyOverlap { .. }
            | Error::KeyFile(..) => ErrorKind::Config,
        }
    }
}
