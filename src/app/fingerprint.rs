//! Cache-key fingerprinting
//!
//! Cache entries are identified by the MD5 of the caller-supplied cache
//! key, stored as a 16-byte array rather than a hex string. The byte
//! representation keeps map lookups cheap and makes the `Ord` used for
//! eviction tie-breaks identical to lexical order of the hex form.

use std::fmt;

/// MD5 fingerprint of a caller-supplied cache key.
///
/// The fingerprint, not the key, names the entry on disk, so arbitrary
/// keys (URLs, paths, anything with separators or quotes) are safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Fingerprint a cache key.
    pub fn from_key(key: &str) -> Self {
        Fingerprint(md5::compute(key.as_bytes()).0)
    }

    /// Lowercase 32-character hex form, as used in on-disk names.
    pub fn to_hex(&self) -> String {
        use std::fmt::Write;
        self.0.iter().fold(String::with_capacity(32), |mut acc, b| {
            write!(&mut acc, "{:02x}", b).expect("writing to a String cannot fail");
            acc
        })
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
