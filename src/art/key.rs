/// Index keys as byte strings whose lexicographic order matches value order.
///
/// Integer types: big-endian with sign bit flipped (so negative < positive in byte order)
/// Strings: raw UTF-8 bytes followed by a 0x00 terminator, so that no string
/// key is a strict prefix of another
/// Raw bytes: taken as-is; the caller guarantees prefix-freeness
use std::ops::Index;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtKey {
    bytes: Vec<u8>,
}

impl ArtKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ArtKey {
            bytes: bytes.into(),
        }
    }

    pub fn from_i32(val: i32) -> Self {
        let unsigned = (val as u32) ^ (1u32 << 31);
        Self::from_bytes(unsigned.to_be_bytes().to_vec())
    }

    pub fn from_i64(val: i64) -> Self {
        // Flip the sign bit so that negative numbers sort before positive
        let unsigned = (val as u64) ^ (1u64 << 63);
        Self::from_bytes(unsigned.to_be_bytes().to_vec())
    }

    pub fn from_u64(val: u64) -> Self {
        Self::from_bytes(val.to_be_bytes().to_vec())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(val: &str) -> Self {
        let mut bytes = Vec::with_capacity(val.len() + 1);
        bytes.extend_from_slice(val.as_bytes());
        bytes.push(0);
        ArtKey { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Index<usize> for ArtKey {
    type Output = u8;

    fn index(&self, index: usize) -> &u8 {
        &self.bytes[index]
    }
}
