//! Key Ordering
//!
//! Total orders over fixed-length byte keys.
//!
//! Every store is created with one `KeyOrder`. It decides index iteration
//! order, which keys are well-formed enough to be indexed, and how keys read
//! back from disk are compared with the expected key.
//!
//! ## Orders
//! - `Natural`: unsigned lexicographic byte order; a key starting with a zero
//!   byte is malformed, since that byte marks free records on disk
//! - `Base64`: position in the enhanced base64 alphabet
//!   `A-Z a-z 0-9 - _`; keys outside the alphabet are malformed

use std::borrow::Cow;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{HeapError, Result};
use crate::heap::EMPTY_MARKER;

/// Enhanced (URL-safe) base64 alphabet in ascending order
const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Reverse lookup: byte → alphabet position, `0xFF` for bytes outside it
const BASE64_POSITION: [u8; 256] = {
    let mut table = [0xFFu8; 256];
    let mut i = 0;
    while i < BASE64_ALPHABET.len() {
        table[BASE64_ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// A total order over byte keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum KeyOrder {
    /// Unsigned byte-wise comparison
    #[default]
    Natural,
    /// Enhanced base64 alphabet order
    Base64,
}

impl KeyOrder {
    /// Short name used in logs and dumps
    pub fn name(&self) -> &'static str {
        match self {
            KeyOrder::Natural => "natural",
            KeyOrder::Base64 => "base64",
        }
    }

    /// Whether a key may be stored under this order
    pub fn wellformed(&self, key: &[u8]) -> bool {
        match self {
            KeyOrder::Natural => key.first() != Some(&EMPTY_MARKER),
            KeyOrder::Base64 => key.iter().all(|&b| BASE64_POSITION[b as usize] != 0xFF),
        }
    }

    /// Compare two keys
    ///
    /// Under `Base64`, malformed keys sort after well-formed ones and two
    /// malformed keys fall back to natural order.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Natural => a.cmp(b),
            KeyOrder::Base64 => match (self.wellformed(a), self.wellformed(b)) {
                (true, true) => {
                    let pa = a.iter().map(|&x| BASE64_POSITION[x as usize]);
                    let pb = b.iter().map(|&x| BASE64_POSITION[x as usize]);
                    pa.cmp(pb)
                }
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => a.cmp(b),
            },
        }
    }

    /// Equality under this order
    pub fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// Transform a well-formed key so that natural byte order of the result
    /// equals this order. Inverse of [`KeyOrder::restore`].
    pub fn sort_key<'a>(&self, key: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            KeyOrder::Natural => Cow::Borrowed(key),
            KeyOrder::Base64 => {
                Cow::Owned(key.iter().map(|&b| BASE64_POSITION[b as usize]).collect())
            }
        }
    }

    /// Turn a sort key back into the original key bytes
    pub fn restore(&self, sort_key: &[u8]) -> Vec<u8> {
        match self {
            KeyOrder::Natural => sort_key.to_vec(),
            KeyOrder::Base64 => sort_key
                .iter()
                .map(|&p| BASE64_ALPHABET[(p & 0x3F) as usize])
                .collect(),
        }
    }

    /// Bring a key to exactly `keylength` bytes
    ///
    /// Long keys are truncated. Short keys are zero-padded under `Natural`
    /// and rejected under `Base64`, whose alphabet has no zero byte.
    pub fn normalize<'a>(&self, key: &'a [u8], keylength: usize) -> Result<Cow<'a, [u8]>> {
        if key.len() == keylength {
            return Ok(Cow::Borrowed(key));
        }
        if key.len() > keylength {
            return Ok(Cow::Borrowed(&key[..keylength]));
        }
        match self {
            KeyOrder::Natural => {
                let mut padded = key.to_vec();
                padded.resize(keylength, 0);
                Ok(Cow::Owned(padded))
            }
            KeyOrder::Base64 => Err(HeapError::InvalidKey(format!(
                "key of {} bytes is shorter than keylength {}",
                key.len(),
                keylength
            ))),
        }
    }
}

/// Render a key for log messages
pub(crate) fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
