// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating the built-in initramfs inside a decompressed kernel

use crate::{keys::find, Error};
use std::ops::Range;

/// `newc` record magic, plus the first two digits of the first inode number
pub const HEADER_MAGIC: &[u8] = b"07070100";

/// Name of the end-of-archive record, with its NUL and alignment padding
pub const TRAILER_MAGIC: &[u8] = b"TRAILER!!!\0\0\0\0";

/// Returns the span of the first embedded archive, from the start of its
/// first record to the end of its trailer record.
///
/// Only the first archive is considered; anything after its trailer is left
/// alone.
pub fn locate(data: &[u8]) -> Result<Range<usize>, Error> {
    let start = find(data, HEADER_MAGIC)
        .ok_or(Error::MissingArchiveStart { magic: HEADER_MAGIC })?;
    let end = find(&data[start..], TRAILER_MAGIC)
        .map(|i| start + i + TRAILER_MAGIC.len())
        .ok_or(Error::MissingArchiveTrailer {
            trailer: TRAILER_MAGIC,
            start,
        })?;
    Ok(start..end)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ErrorKind;

    /// Builds a tiny `newc` archive holding one file, followed by the
    /// trailer record.
    pub(crate) fn archive(name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        record(&mut out, 0x100, 0o100644, name, body);
        record(&mut out, 0, 0, "TRAILER!!!", &[]);
        out
    }

    fn record(
        out: &mut Vec<u8>,
        ino: u32,
        mode: u32,
        name: &str,
        body: &[u8],
    ) {
        let fields = [
            ino,
            mode,
            0,
            0,
            1,
            0,
            body.len() as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ];
        out.extend(b"070701");
        for f in fields {
            out.extend(format!("{f:08X}").as_bytes());
        }
        out.extend(name.as_bytes());
        out.push(0);
        pad(out);
        out.extend(body);
        pad(out);
    }

    fn pad(out: &mut Vec<u8>) {
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }

    #[test]
    fn archive_is_found_in_surrounding_noise() {
        let cpio = archive("key", &[0x42; 32]);
        let mut data = vec![0x90; 123];
        data.extend(&cpio);
        data.extend([0xcc; 77]);

        let range = locate(&data).unwrap();
        assert_eq!(range, 123..123 + cpio.len());
        assert!(data[range.clone()].starts_with(HEADER_MAGIC));
        assert!(data[range].ends_with(TRAILER_MAGIC));
    }

    #[test]
    fn only_the_first_archive_counts() {
        let cpio = archive("key", &[0x42; 32]);
        let mut data = cpio.clone();
        data.extend(&cpio);
        assert_eq!(locate(&data).unwrap(), 0..cpio.len());
    }

    #[test]
    fn missing_header() {
        let e = locate(&[0u8; 256]).unwrap_err();
        assert!(matches!(e, Error::MissingArchiveStart { .. }));
        assert_eq!(e.kind(), ErrorKind::Format);
    }

    #[test]
    fn trailer_before_header_is_not_used() {
        let mut data = TRAILER_MAGIC.to_vec();
        data.extend(b"07070100000000");
        let e = locate(&data).unwrap_err();
        assert!(matches!(e, Error::MissingArchiveTrailer { start: 14, .. }));
    }
}
