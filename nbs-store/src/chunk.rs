//! The unit of storage: an address/payload pair.

use std::fmt;

use crate::hash::Address;

/// A content-addressed blob. The address is always `Address::hash(&data)`;
/// construction through [`Chunk::new`] is the only sanctioned way to build
/// one so that invariant can never be violated from outside this crate.
#[derive(Clone)]
pub struct Chunk {
    address: Address,
    data: Vec<u8>,
}

impl Chunk {
    /// Hash `data` and wrap it as a chunk.
    pub fn new(data: Vec<u8>) -> Self {
        let address = Address::hash(&data);
        Chunk { address, data }
    }

    /// Reconstruct a chunk whose address is already known (e.g. read back
    /// off disk), verifying it against the data rather than trusting it.
    pub fn with_address(address: Address, data: Vec<u8>) -> Result<Self, anyhow::Error> {
        let computed = Address::hash(&data);
        if computed != address {
            anyhow::bail!(
                "chunk data does not match claimed address {}: computed {}",
                address,
                computed
            );
        }
        Ok(Chunk { address, data })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("address", &self.address)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_derived_from_content() {
        let chunk = Chunk::new(b"payload".to_vec());
        assert_eq!(chunk.address(), Address::hash(b"payload"));
    }

    #[test]
    fn with_address_rejects_mismatched_content() {
        let wrong = Address::hash(b"something else");
        assert!(Chunk::with_address(wrong, b"payload".to_vec()).is_err());
    }

    #[test]
    fn empty_chunk_is_valid() {
        let chunk = Chunk::new(Vec::new());
        assert!(chunk.is_empty());
        assert_eq!(chunk.address(), Address::hash(b""));
    }
}
