// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! XZ codec for the compressed kernel payload
//!
//! The x86 kernel build compresses `vmlinux` with the x86 BCJ filter in
//! front of LZMA2 and a CRC32 integrity check (the in-kernel decompressor
//! does not support anything stronger). We have to produce a stream that
//! the same decompressor accepts, so the filter chain and parameters below
//! are fixed.

use crate::Error;
use std::io::{Read, Write};
use xz2::{
    read::XzDecoder,
    stream::{Check, Filters, LzmaOptions, Stream},
    write::XzEncoder,
};

/// LZMA2 preset level used when recompressing
pub const PRESET: u32 = 8;

/// LZMA2 dictionary size used when recompressing
pub const DICT_SIZE: u32 = 32 * 1024 * 1024;

/// Decompresses `data`, which must expand to exactly `expected_len` bytes.
///
/// Null stream padding after the stream is accepted.
pub fn decode(data: &[u8], expected_len: u32) -> Result<Vec<u8>, Error> {
    let mut out = vec![];
    XzDecoder::new_multi_decoder(data)
        .read_to_end(&mut out)
        .map_err(Error::Decompress)?;

    if out.len() != expected_len as usize {
        return Err(Error::SizeMismatch {
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Compresses `data` with the kernel's filter chain.
///
/// The output is deterministic for a given input. It is not necessarily
/// smaller than whatever stream `data` originally came from; callers that
/// have a size budget must check it themselves.
pub fn encode(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut opts = LzmaOptions::new_preset(PRESET)?;
    opts.dict_size(DICT_SIZE);

    let mut filters = Filters::new();
    filters.x86().lzma2(&opts);

    let stream = Stream::new_stream_encoder(&filters, Check::Crc32)?;
    let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(data).map_err(Error::Compress)?;
    encoder.finish().map_err(Error::Compress)
}
