// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-offset fields of the EFI-stub kernel container

use crate::Error;
use std::ops::Range;
use zerocopy::{
    byteorder::{LittleEndian, U32},
    AsBytes, FromBytes,
};

type Le32 = U32<LittleEndian>;

/// `PointerToRawData` of the PE `.text` section, which is where the
/// setup header offsets below are relative to
pub const SECTION_BASE_OFFSET: usize = 414;

/// Setup header `payload_offset` field
pub const PAYLOAD_OFFSET: usize = 584;

/// Setup header `payload_length` field
pub const PAYLOAD_LENGTH_OFFSET: usize = PAYLOAD_OFFSET + 4;

/// The last four bytes of the payload are the decompressed size
pub const SIZE_TRAILER_LEN: usize = 4;

/// Where the compressed kernel sits inside the container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadDescriptor {
    /// Absolute offset of the compressed stream within the container
    pub offset: usize,
    /// Length of the compressed stream, excluding the size trailer
    pub len: usize,
    /// Size of the decompressed kernel, read from the trailer
    pub decompressed_len: u32,
}

impl PayloadDescriptor {
    /// Reads the header fields and the size trailer.
    ///
    /// No sanity checking is done beyond keeping every read in bounds; a
    /// bogus header shows up as a decompression failure later on.
    pub fn locate(image: &[u8]) -> Result<Self, Error> {
        let base = read_u32(image, SECTION_BASE_OFFSET)?;
        let relative = read_u32(image, PAYLOAD_OFFSET)?;
        let field_len = read_u32(image, PAYLOAD_LENGTH_OFFSET)?;

        let len = (field_len as usize)
            .checked_sub(SIZE_TRAILER_LEN)
            .ok_or(Error::PayloadTooShort(field_len))?;
        let offset = base as usize + relative as usize;

        let trailer = offset + len;
        let decompressed_len =
            read_u32(image, trailer).map_err(|_| Error::PayloadOutOfBounds {
                range: offset..trailer + SIZE_TRAILER_LEN,
                len: image.len(),
            })?;

        Ok(Self {
            offset,
            len,
            decompressed_len,
        })
    }

    /// The compressed stream, without its trailer
    pub fn stream_range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// The whole payload span, trailer included
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len + SIZE_TRAILER_LEN
    }
}

pub(crate) fn read_u32(image: &[u8], offset: usize) -> Result<u32, Error> {
    image
        .get(offset..offset + 4)
        .and_then(Le32::read_from)
        .map(|v| v.get())
        .ok_or(Error::HeaderOutOfBounds {
            offset,
            len: image.len(),
        })
}

pub(crate) fn write_u32(
    image: &mut [u8],
    offset: usize,
    value: u32,
) -> Result<(), Error> {
    let len = image.len();
    image
        .get_mut(offset..)
        .and_then(|out| Le32::new(value).write_to_prefix(out))
        .ok_or(Error::HeaderOutOfBounds { offset, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(base: u32, relative: u32, len: u32, size: u32) -> Vec<u8> {
        let mut out = vec![0u8; 1024];
        write_u32(&mut out, SECTION_BASE_OFFSET, base).unwrap();
        write_u32(&mut out, PAYLOAD_OFFSET, relative).unwrap();
        write_u32(&mut out, PAYLOAD_LENGTH_OFFSET, len).unwrap();
        write_u32(&mut out, (base + relative + len) as usize - 4, size)
            .unwrap();
        out
    }

    #[test]
    fn fields_are_little_endian() {
        let mut out = vec![0u8; 8];
        write_u32(&mut out, 2, 0x1234_5678).unwrap();
        assert_eq!(out, [0, 0, 0x78, 0x56, 0x34, 0x12, 0, 0]);
        assert_eq!(read_u32(&out, 2).unwrap(), 0x1234_5678);
    }

    #[test]
    fn locate_payload() {
        let img = image(0x200, 600 - 0x200, 200, 0xdead);
        let p = PayloadDescriptor::locate(&img).unwrap();
        assert_eq!(
            p,
            PayloadDescriptor {
                offset: 600,
                len: 196,
                decompressed_len: 0xdead,
            }
        );
        assert_eq!(p.stream_range(), 600..796);
        assert_eq!(p.range(), 600..800);
    }

    #[test]
    fn truncated_header() {
        let e = PayloadDescriptor::locate(&[0u8; 500]).unwrap_err();
        assert!(matches!(
            e,
            Error::HeaderOutOfBounds {
                offset: PAYLOAD_OFFSET,
                len: 500
            }
        ));
    }

    #[test]
    fn payload_past_the_end() {
        let mut img = image(0x200, 600 - 0x200, 200, 0);
        write_u32(&mut img, PAYLOAD_LENGTH_OFFSET, 2000).unwrap();
        let e = PayloadDescriptor::locate(&img).unwrap_err();
        assert!(matches!(e, Error::PayloadOutOfBounds { .. }));
        assert_eq!(e.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn payload_shorter_than_trailer() {
        let mut img = image(0x200, 600 - 0x200, 200, 0);
        write_u32(&mut img, PAYLOAD_LENGTH_OFFSET, 3).unwrap();
        let e = PayloadDescriptor::locate(&img).unwrap_err();
        assert!(matches!(e, Error::PayloadTooShort(3)));
    }
}
