//! Content addresses.
//!
//! An [`Address`] is the 20-byte digest that keys every chunk and every table
//! file in the store. Ordering is big-endian lexicographic, which for a
//! fixed-size byte array is exactly what `#[derive(Ord)]` gives us, so the
//! type can be dropped straight into a `BTreeMap`/binary search without a
//! custom `Ord` impl.

use std::fmt;

/// Size in bytes of an [`Address`].
pub const ADDRESS_LEN: usize = 20;

/// Size in bytes of the [`Address`] prefix used for sorting/binary search.
pub const PREFIX_LEN: usize = 8;

/// 20-byte content digest, big-endian lexicographically ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Content-hash `data` into an address.
    pub fn hash(data: &[u8]) -> Self {
        Address(openssl::sha::sha1(data))
    }

    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// First 8 bytes, interpreted big-endian, used for index sort/search.
    pub fn prefix(&self) -> u64 {
        let mut buf = [0u8; PREFIX_LEN];
        buf.copy_from_slice(&self.0[..PREFIX_LEN]);
        u64::from_be_bytes(buf)
    }

    /// The trailing 12 bytes stored in a table's suffix vector.
    pub fn suffix(&self) -> [u8; ADDRESS_LEN - PREFIX_LEN] {
        let mut buf = [0u8; ADDRESS_LEN - PREFIX_LEN];
        buf.copy_from_slice(&self.0[PREFIX_LEN..]);
        buf
    }

    pub fn from_prefix_and_suffix(prefix: u64, suffix: &[u8; ADDRESS_LEN - PREFIX_LEN]) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[..PREFIX_LEN].copy_from_slice(&prefix.to_be_bytes());
        bytes[PREFIX_LEN..].copy_from_slice(suffix);
        Address(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LEN]
    }

    pub fn zero() -> Self {
        Address([0u8; ADDRESS_LEN])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, anyhow::Error> {
        let raw = hex::decode(s)?;
        if raw.len() != ADDRESS_LEN {
            anyhow::bail!("expected {} byte address, got {}", ADDRESS_LEN, raw.len());
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Address(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_content_addressed() {
        let a = Address::hash(b"hello world");
        let b = Address::hash(b"hello world");
        assert_eq!(a, b);
        let c = Address::hash(b"hello world!");
        assert_ne!(a, c);
    }

    #[test]
    fn zero_length_chunk_hashes() {
        // Boundary: zero-length chunk is accepted and hashed like any other.
        let a = Address::hash(b"");
        assert!(!a.is_zero());
    }

    #[test]
    fn prefix_suffix_roundtrip() {
        let a = Address::hash(b"round trip me");
        let rebuilt = Address::from_prefix_and_suffix(a.prefix(), &a.suffix());
        assert_eq!(a, rebuilt);
    }

    #[test]
    fn ordering_is_big_endian_lexicographic() {
        let a = Address([0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let b = Address([0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(a < b);
    }
}
