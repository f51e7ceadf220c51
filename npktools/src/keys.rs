// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-length key substitution

use crate::Error;
use memchr::memmem;
use serde::Deserialize;
use std::fmt;

/// A single `old -> new` substitution rule
///
/// Both keys always have the same (non-zero) length, so substituting one for
/// the other never moves any byte around it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    name: String,
    old: Vec<u8>,
    new: Vec<u8>,
}

impl KeyPair {
    pub fn new(
        name: impl Into<String>,
        old: Vec<u8>,
        new: Vec<u8>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if old.is_empty() || new.is_empty() {
            return Err(Error::EmptyKey { name });
        }
        if old.len() != new.len() {
            return Err(Error::KeyLengthMismatch {
                name,
                old: old.len(),
                new: new.len(),
            });
        }
        Ok(Self { name, old, new })
    }

    /// Builds a pair from two hex strings; surrounding whitespace is ignored
    pub fn from_hex(
        name: impl Into<String>,
        old: &str,
        new: &str,
    ) -> Result<Self, Error> {
        let name = name.into();
        let decode = |s: &str| {
            hex::decode(s.trim()).map_err(|source| Error::KeyHex {
                name: name.clone(),
                source,
            })
        };
        let old = decode(old)?;
        let new = decode(new)?;
        Self::new(name, old, new)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn old_key(&self) -> &[u8] {
        &self.old
    }

    pub fn new_key(&self) -> &[u8] {
        &self.new
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("old", &fingerprint(&self.old))
            .field("new", &fingerprint(&self.new))
            .finish()
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.name, fingerprint(&self.old))
    }
}

/// Short printable form of a key: up to 16 bytes in hex, then `...`
pub fn fingerprint(key: &[u8]) -> String {
    let head = &key[..key.len().min(16)];
    format!("{}...", hex::encode_upper(head))
}

#[derive(Deserialize)]
struct KeyFile {
    #[serde(default)]
    pair: Vec<KeyFileEntry>,
}

#[derive(Deserialize)]
struct KeyFileEntry {
    name: String,
    old: String,
    new: String,
}

/// Read-only substitution table shared by every patching step of a job
#[derive(Clone, Debug)]
pub struct KeySet {
    pairs: Vec<KeyPair>,
}

/// Occurrence counts for one pair, as reported by [`KeySet::scan`]
#[derive(Debug, PartialEq, Eq)]
pub struct KeyScan<'a> {
    pub pair: &'a KeyPair,
    pub old: usize,
    pub new: usize,
}

impl KeySet {
    /// Validates and wraps a list of pairs.
    ///
    /// No new key may contain any old key, so that substituting twice is the
    /// same as substituting once.
    pub fn new(pairs: Vec<KeyPair>) -> Result<Self, Error> {
        for p in &pairs {
            for q in &pairs {
                if find(&p.new, &q.old).is_some() {
                    return Err(Error::KeyOverlap {
                        new: p.name.clone(),
                        old: q.name.clone(),
                    });
                }
            }
        }
        Ok(Self { pairs })
    }

    /// Parses a TOML key file made of `[[pair]]` tables, each with a
    /// `name` and hex-encoded `old` and `new` keys.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let file: KeyFile = toml::from_str(text)?;
        let pairs = file
            .pair
            .into_iter()
            .map(|e| KeyPair::from_hex(e.name, &e.old, &e.new))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(pairs)
    }

    pub fn pairs(&self) -> &[KeyPair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Replaces every non-overlapping occurrence of each old key with its
    /// new key, in place.
    ///
    /// Returns the pairs that matched at least once, in table order. A key
    /// that is not present is not an error; plenty of files carry none.
    pub fn substitute(&self, buf: &mut [u8]) -> Vec<&KeyPair> {
        let mut matched = vec![];
        for pair in &self.pairs {
            if replace_all(buf, &pair.old, &pair.new) > 0 {
                matched.push(pair);
            }
        }
        matched
    }

    /// Counts old and new key occurrences without modifying anything
    pub fn scan(&self, buf: &[u8]) -> Vec<KeyScan<'_>> {
        self.pairs
            .iter()
            .map(|pair| KeyScan {
                pair,
                old: count(buf, &pair.old),
                new: count(buf, &pair.new),
            })
            .collect()
    }

    /// Pairs that are absent from `matched`
    pub fn unmatched<'a>(
        &'a self,
        matched: &[&KeyPair],
    ) -> impl Iterator<Item = &'a KeyPair> + 'a {
        let names: Vec<String> =
            matched.iter().map(|p| p.name.clone()).collect();
        self.pairs.iter().filter(move |p| !names.contains(&p.name))
    }
}

/// Position of the first occurrence of `needle` in `haystack`
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    memmem::find(haystack, needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    memmem::find_iter(haystack, needle).count()
}

fn replace_all(buf: &mut [u8], old: &[u8], new: &[u8]) -> usize {
    debug_assert_eq!(old.len(), new.len());
    let hits: Vec<usize> = memmem::find_iter(buf, old).collect();
    for &at in &hits {
        buf[at..at + old.len()].copy_from_slice(new);
    }
    hits.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str, old: u8, new: u8) -> KeyPair {
        KeyPair::new(name, vec![old; 8], vec![new; 8]).unwrap()
    }

    #[test]
    fn substitute_replaces_every_occurrence() {
        let keys = KeySet::new(vec![pair("a", 0xaa, 0x11)]).unwrap();
        let mut buf = vec![0u8; 4];
        buf.extend([0xaa; 8]);
        buf.extend([0u8; 3]);
        buf.extend([0xaa; 8]);
        let len = buf.len();

        let matched = keys.substitute(&mut buf);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "a");
        assert_eq!(buf.len(), len);
        assert_eq!(&buf[4..12], &[0x11; 8]);
        assert_eq!(&buf[15..23], &[0x11; 8]);
        assert!(find(&buf, &[0xaa; 8]).is_none());
    }

    #[test]
    fn keys_in_a_large_buffer() {
        let keys =
            KeySet::new(vec![pair("a", 0xaa, 0x11), pair("b", 0xbb, 0x22)])
                .unwrap();
        let mut buf = vec![0u8; 4 << 20];
        for at in [0, 1 << 20, (4 << 20) - 8] {
            buf[at..at + 8].copy_from_slice(&[0xaa; 8]);
        }
        buf[3 << 20..(3 << 20) + 8].copy_from_slice(&[0xbb; 8]);

        let scan = keys.scan(&buf);
        assert_eq!((scan[0].old, scan[1].old), (3, 1));
        assert_eq!(keys.substitute(&mut buf).len(), 2);
        let scan = keys.scan(&buf);
        assert_eq!((scan[0].old, scan[0].new), (0, 3));
        assert_eq!((scan[1].old, scan[1].new), (0, 1));
        assert_eq!(&buf[(4 << 20) - 8..], &[0x11; 8]);
    }

    #[test]
    fn occurrences_do_not_overlap() {
        let keys = KeySet::new(vec![pair("a", 0xaa, 0x11)]).unwrap();
        // Twelve 0xaa bytes hold one full key plus a partial one
        let mut buf = vec![0xaa; 12];
        keys.substitute(&mut buf);
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert_eq!(&buf[8..], &[0xaa; 4]);
    }

    #[test]
    fn substitute_is_idempotent() {
        let keys =
            KeySet::new(vec![pair("a", 0xaa, 0x11), pair("b", 0xbb, 0x22)])
                .unwrap();
        let mut buf = vec![0u8; 64];
        buf[3..11].copy_from_slice(&[0xaa; 8]);
        buf[40..48].copy_from_slice(&[0xbb; 8]);

        let first = keys.substitute(&mut buf);
        assert_eq!(first.len(), 2);
        let once = buf.clone();

        let second = keys.substitute(&mut buf);
        assert!(second.is_empty());
        assert_eq!(buf, once);
    }

    #[test]
    fn missing_key_is_not_an_error() {
        let keys =
            KeySet::new(vec![pair("a", 0xaa, 0x11), pair("b", 0xbb, 0x22)])
                .unwrap();
        let mut buf = vec![0xbb; 8];
        let matched = keys.substitute(&mut buf);
        assert_eq!(matched.len(), 1);
        let missing: Vec<_> =
            keys.unmatched(&matched).map(|p| p.name()).collect();
        assert_eq!(missing, ["a"]);
    }

    #[test]
    fn unequal_lengths_are_rejected() {
        let e = KeyPair::new("a", vec![1; 8], vec![2; 7]).unwrap_err();
        assert!(matches!(
            e,
            Error::KeyLengthMismatch { old: 8, new: 7, .. }
        ));
        assert_eq!(e.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn new_key_containing_old_key_is_rejected() {
        let mut new = vec![0xcc; 16];
        new[4..12].copy_from_slice(&[0xaa; 8]);
        let sneaky = KeyPair::new("b", vec![0xbb; 16], new).unwrap();
        let e = KeySet::new(vec![pair("a", 0xaa, 0x11), sneaky]).unwrap_err();
        assert!(matches!(e, Error::KeyOverlap { .. }));
    }

    #[test]
    fn hex_keys() {
        let p = KeyPair::from_hex("a", "00ff10\n", " 0102aa").unwrap();
        assert_eq!(p.old_key(), &[0x00, 0xff, 0x10]);
        assert_eq!(p.new_key(), &[0x01, 0x02, 0xaa]);

        let e = KeyPair::from_hex("a", "zz", "00").unwrap_err();
        assert!(matches!(e, Error::KeyHex { .. }));
    }

    #[test]
    fn key_file() {
        let keys = KeySet::from_toml(
            r#"
            [[pair]]
            name = "license"
            old = "aabbccdd"
            new = "11223344"

            [[pair]]
            name = "npk-sign"
            old = "0000ffff"
            new = "ffff0000"
            "#,
        )
        .unwrap();
        let names: Vec<_> = keys.pairs().iter().map(|p| p.name()).collect();
        assert_eq!(names, ["license", "npk-sign"]);
        assert_eq!(keys.pairs()[0].old_key(), &[0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn scan_counts_both_sides() {
        let keys = KeySet::new(vec![pair("a", 0xaa, 0x11)]).unwrap();
        let mut buf = vec![0xaa; 8];
        buf.extend([0x11; 16]);
        let scan = keys.scan(&buf);
        assert_eq!(scan[0].old, 1);
        assert_eq!(scan[0].new, 2);
    }

    #[test]
    fn fingerprints_are_truncated() {
        assert_eq!(fingerprint(&[0xab; 4]), "ABABABAB...");
        assert_eq!(
            fingerprint(&[0x01; 32]),
            "01010101010101010101010101010101..."
        );
    }
}
