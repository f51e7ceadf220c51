// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key substitution inside the kernel container's built-in initramfs

use crate::{
    cpio,
    header::{self, PayloadDescriptor, PAYLOAD_LENGTH_OFFSET, SIZE_TRAILER_LEN},
    keys::{KeyPair, KeySet},
    xz, Error,
};
use log::{info, warn};
use std::ops::Range;

/// Result of a successful [`patch`]
#[derive(Debug)]
pub struct KernelPatch<'k> {
    /// The rewritten container, same length as the input
    pub image: Vec<u8>,
    /// Payload location in the original container
    pub payload: PayloadDescriptor,
    /// Length of the recompressed stream, excluding the size trailer
    pub new_len: usize,
    /// Archive span within the decompressed kernel
    pub archive: Range<usize>,
    /// Keys that were found (and replaced) in the archive
    pub matched: Vec<&'k KeyPair>,
}

/// What [`inspect`] found in a container
#[derive(Debug, PartialEq, Eq)]
pub struct KernelReport {
    pub payload: PayloadDescriptor,
    pub archive: Range<usize>,
}

fn decode_payload(
    image: &[u8],
) -> Result<(PayloadDescriptor, Vec<u8>), Error> {
    info!("kernel image is {} bytes", image.len());
    let payload = PayloadDescriptor::locate(image)?;
    info!(
        "compressed kernel at {:#x}, {} bytes (+{} byte trailer)",
        payload.offset, payload.len, SIZE_TRAILER_LEN
    );
    info!("expected decompressed size: {}", payload.decompressed_len);

    let stream = image.get(payload.stream_range()).ok_or_else(|| {
        Error::PayloadOutOfBounds {
            range: payload.range(),
            len: image.len(),
        }
    })?;
    let vmlinux = xz::decode(stream, payload.decompressed_len)?;
    info!("decompressed kernel is {} bytes", vmlinux.len());
    Ok((payload, vmlinux))
}

/// Returns the decompressed kernel held by the container
pub fn extract_payload(image: &[u8]) -> Result<Vec<u8>, Error> {
    decode_payload(image).map(|(_, vmlinux)| vmlinux)
}

/// Locates the payload and the archive inside it, without changing anything
pub fn inspect(image: &[u8]) -> Result<KernelReport, Error> {
    let (payload, vmlinux) = decode_payload(image)?;
    let archive = cpio::locate(&vmlinux)?;
    Ok(KernelReport { payload, archive })
}

/// Swaps keys in the kernel's built-in initramfs and rebuilds the container.
///
/// Only the archive span of the decompressed kernel is touched. The new
/// compressed stream has to fit in the space of the old one: the stream is
/// followed by the original size trailer and zero-padded up to the old
/// payload length, so everything after the payload stays where it was. The
/// header's length field is updated to cover the new stream and its trailer.
///
/// On failure the input is left untouched and nothing is returned.
pub fn patch<'k>(
    image: &[u8],
    keys: &'k KeySet,
) -> Result<KernelPatch<'k>, Error> {
    let (payload, mut vmlinux) = decode_payload(image)?;

    let archive = cpio::locate(&vmlinux)?;
    info!(
        "initramfs at {:#x}..{:#x} ({} bytes)",
        archive.start,
        archive.end,
        archive.len()
    );

    let matched = keys.substitute(&mut vmlinux[archive.clone()]);
    for pair in &matched {
        info!("initramfs public key patched: {pair}");
    }
    for pair in keys.unmatched(&matched) {
        warn!("initramfs does not contain key {pair}");
    }

    let mut stream = xz::encode(&vmlinux)?;
    let new_len = stream.len();
    info!("recompressed kernel is {new_len} bytes (budget {})", payload.len);
    if new_len > payload.len {
        return Err(Error::BudgetExceeded {
            budget: payload.len,
            actual: new_len,
        });
    }

    stream.extend(payload.decompressed_len.to_le_bytes());
    stream.resize(payload.range().len(), 0);

    let mut out = image.to_vec();
    // The decompressor reads the size trailer from the last four bytes of
    // the length it is given, so the field covers the new stream and the
    // trailer right behind it; the zero padding stays outside it.
    header::write_u32(
        &mut out,
        PAYLOAD_LENGTH_OFFSET,
        (new_len + SIZE_TRAILER_LEN) as u32,
    )?;
    out[payload.range()].copy_from_slice(&stream);

    Ok(KernelPatch {
        image: out,
        payload,
        new_len,
        archive,
        matched,
    })
}
