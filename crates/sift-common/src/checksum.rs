use bytes::Bytes;
use std::fmt;

/// Opaque content checksum.
///
/// Equality is bytewise; two checksums of different length are never equal.
/// The width is whatever the producer wrote (SHA-1 in practice), the engine
/// never interprets the bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Checksum(Bytes);

impl Checksum {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// Parse the hex text form used in the cache enumeration hash.
    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(Bytes::from(hex::decode(text)?)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl From<Vec<u8>> for Checksum {
    fn from(raw: Vec<u8>) -> Self {
        Self(Bytes::from(raw))
    }
}
