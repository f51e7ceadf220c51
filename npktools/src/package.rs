// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Patching a whole system package
//!
//! The package format itself (part table, file container encoding and the
//! signature scheme) is provided by the caller through [`Package`] and
//! [`FileContainer`]; this module only decides what gets patched and in
//! which order.

use crate::{
    kernel::{self, KernelReport},
    squashfs::{self, SquashfsOptions, TreeReport},
    Error, KeySet,
};
use log::info;
use std::fmt;

/// Package parts this crate cares about
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartId {
    /// Serialized list of named files, including the kernel container
    FileContainer,
    /// Compressed root filesystem image
    Squashfs,
}

pub trait Package {
    type SignError: std::error::Error + Send + Sync + 'static;

    fn part(&self, id: PartId) -> Option<&[u8]>;
    fn set_part(&mut self, id: PartId, data: Vec<u8>);

    /// Re-signs the package with the license (KCDSA) and package signing
    /// (EdDSA) private keys
    fn sign(
        &mut self,
        license_key: &[u8],
        signing_key: &[u8],
    ) -> Result<(), Self::SignError>;
}

pub trait FileContainer: Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    fn decode(data: &[u8]) -> Result<Self, Self::Error>;
    fn encode(&self) -> Vec<u8>;

    /// Contents of the file called `name`, if present
    fn file_mut(&mut self, name: &[u8]) -> Option<&mut Vec<u8>>;
}

/// Private keys handed to [`Package::sign`]
#[derive(Clone)]
pub struct SigningKeys {
    pub license: Vec<u8>,
    pub package: Vec<u8>,
}

impl SigningKeys {
    /// Decodes the two private keys from hex; surrounding whitespace is
    /// ignored
    pub fn from_hex(license: &str, package: &str) -> Result<Self, Error> {
        let decode = |name: &str, s: &str| -> Result<Vec<u8>, Error> {
            let key = hex::decode(s.trim()).map_err(|source| {
                Error::KeyHex {
                    name: name.to_owned(),
                    source,
                }
            })?;
            if key.is_empty() {
                return Err(Error::EmptyKey {
                    name: name.to_owned(),
                });
            }
            Ok(key)
        };
        Ok(Self {
            license: decode("license-private", license)?,
            package: decode("npk-sign-private", package)?,
        })
    }
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SigningKeys").finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct PackageOptions {
    /// File container entry holding the kernel
    pub kernel_entry: String,
    pub squashfs: SquashfsOptions,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            kernel_entry: "boot/EFI/BOOT/BOOTX64.EFI".to_owned(),
            squashfs: SquashfsOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct PackageReport {
    pub kernel: KernelReport,
    /// Names of the keys replaced in the kernel's initramfs
    pub kernel_keys: Vec<String>,
    pub tree: TreeReport,
}

/// Patches the kernel and the root filesystem of `package`, then signs it.
///
/// Parts are only replaced once both have been patched successfully, so on
/// error the package is left as it was and is not signed.
pub fn patch_package<P, C>(
    package: &mut P,
    keys: &KeySet,
    signing: &SigningKeys,
    opts: &PackageOptions,
) -> Result<PackageReport, Error>
where
    P: Package,
    C: FileContainer,
{
    let data = package
        .part(PartId::FileContainer)
        .ok_or(Error::MissingPart(PartId::FileContainer))?;
    let mut files =
        C::decode(data).map_err(|e| Error::FileContainer(Box::new(e)))?;

    let entry = files
        .file_mut(opts.kernel_entry.as_bytes())
        .ok_or_else(|| Error::MissingKernelEntry(opts.kernel_entry.clone()))?;
    info!("patching {}", opts.kernel_entry);
    let patched = kernel::patch(entry, keys)?;
    let kernel_keys =
        patched.matched.iter().map(|p| p.name().to_owned()).collect();
    let kernel = KernelReport {
        payload: patched.payload,
        archive: patched.archive,
    };
    *entry = patched.image;
    let file_container = files.encode();

    let image = package
        .part(PartId::Squashfs)
        .ok_or(Error::MissingPart(PartId::Squashfs))?;
    let (squashfs, tree) = squashfs::patch_image(image, keys, &opts.squashfs)?;

    package.set_part(PartId::FileContainer, file_container);
    package.set_part(PartId::Squashfs, squashfs);

    info!("signing package");
    package
        .sign(&signing.license, &signing.package)
        .map_err(|e| Error::Sign(Box::new(e)))?;

    Ok(PackageReport {
        kernel,
        kernel_keys,
        tree,
    })
}
