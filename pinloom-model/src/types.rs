//! Strong type for 32-byte content hashes
//!
//! Everything pinned, sequenced or verified in pinloom is identified by a
//! BLAKE3 hash. On the JSON wire the hash travels as lowercase hex.

use std::fmt;

/// 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Returns the inner bytes as a slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Hash(blake3::hash(data).into())
    }

    /// Parse from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("expected 64 hex characters, got {}", v.len() * 2))?;
        Ok(Hash(arr))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(h: Hash) -> [u8; 32] {
        h.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::ops::Deref for Hash {
    type Target = [u8; 32];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = std::array::TryFromSliceError;
    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Hash(<[u8; 32]>::try_from(slice)?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

impl fmt::LowerHex for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl serde::Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_display() {
        let hash = Hash([0xab; 32]);
        let expected = "abababababababababababababababababababababababababababababababab";
        assert_eq!(format!("{}", hash), expected);
        assert_eq!(format!("{:?}", hash), format!("Hash({})", expected));
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash::of(b"hello");
        let parsed = Hash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);
        assert!(Hash::from_hex("abcd").is_err());
        assert!(Hash::from_hex("zz".repeat(32).as_str()).is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = Hash::of(b"payload");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_from_into() {
        let bytes: [u8; 32] = [1; 32];
        let hash: Hash = bytes.into();
        let back: [u8; 32] = hash.into();
        assert_eq!(bytes, back);
        assert_eq!(*hash, bytes);
    }
}
