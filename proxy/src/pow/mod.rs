/// Proof-of-work arithmetic
///
/// Fixed-width integers, difficulty/target conversion, compact targets,
/// header assembly and base58check addresses.

pub mod address;
pub mod header;
pub mod target;

use std::fmt;

use hex::FromHex;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

pub use address::{base58check_decode, is_valid_address};
pub use header::{build_block_header, compact_size};
pub use target::{
    compact_to_target, compare_targets, difficulty_to_target, target_to_difficulty, Difficulty,
    MAX_DIFFICULTY, POW_LIMIT,
};

/// 256-bit unsigned integer, 32 bytes big-endian.
///
/// The derived ordering compares bytes from the most significant end, which
/// for a fixed width is the numeric ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uint256(pub [u8; 32]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0u8; 32]);
    pub const MAX: Uint256 = Uint256([0xffu8; 32]);

    /// Right-align a big-endian value into 32 bytes. `None` if it is wider.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        // Leading zero bytes do not count towards the width.
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let significant = &bytes[start..];
        if significant.len() > 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out[32 - significant.len()..].copy_from_slice(significant);
        Some(Uint256(out))
    }

    pub fn from_biguint(value: &BigUint) -> Option<Self> {
        Self::from_be_slice(&value.to_bytes_be())
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        <[u8; 32]>::from_hex(s).map(Uint256)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint256({})", self.to_hex())
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 128-bit value used for the two nonce halves.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uint128(pub [u8; 16]);

impl Uint128 {
    /// Server-chosen nonce prefix: instance id followed by the little-endian
    /// session id.
    pub fn nonce_partition(server_id: [u8; 8], session_id: u64) -> Self {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&server_id);
        out[8..].copy_from_slice(&session_id.to_le_bytes());
        Uint128(out)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        <[u8; 16]>::from_hex(s).map(Uint128)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Uint128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint128({})", self.to_hex())
    }
}

impl fmt::Display for Uint128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Double SHA-256 over the concatenation of `parts`.
pub fn sha256d(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let round1 = hasher.finalize();
    Sha256::digest(round1).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint256_numeric_ordering() {
        let mut small = [0u8; 32];
        small[31] = 0xff;
        let mut large = [0u8; 32];
        large[30] = 0x01;
        assert!(Uint256(small) < Uint256(large));
        assert!(Uint256::ZERO < Uint256(small));
        assert!(Uint256(large) < Uint256::MAX);
    }

    #[test]
    fn test_uint256_from_be_slice() {
        let v = Uint256::from_be_slice(&[0x12, 0x34]).unwrap();
        assert_eq!(v.0[30], 0x12);
        assert_eq!(v.0[31], 0x34);

        // Leading zeros beyond 32 bytes are fine, significant bytes are not.
        let mut wide = vec![0u8; 40];
        wide[39] = 1;
        assert!(Uint256::from_be_slice(&wide).is_some());
        assert!(Uint256::from_be_slice(&[1u8; 33]).is_none());
    }

    #[test]
    fn test_nonce_partition_layout() {
        let server = [0xaa; 8];
        let p = Uint128::nonce_partition(server, 0x0102);
        assert_eq!(&p.0[..8], &server);
        assert_eq!(&p.0[8..], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(p.to_hex(), "aaaaaaaaaaaaaaaa0201000000000000");
    }

    #[test]
    fn test_nonce_partitions_distinct_per_session() {
        let server = *b"proxy-01";
        let mut seen = std::collections::HashSet::new();
        for id in 1..=1000u64 {
            assert!(seen.insert(Uint128::nonce_partition(server, id)));
        }
    }

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("hello")
        let h = sha256d(&[&b"hel"[..], &b"lo"[..]]);
        assert_eq!(
            hex::encode(h),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }
}
