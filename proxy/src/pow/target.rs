/// Difficulty <-> target conversion and compact ("nBits") decoding
///
/// All arithmetic is exact integer division against `POW_LIMIT`.

use std::cmp::Ordering;

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use super::Uint256;
use crate::error::{ProxyError, Result};

pub type Difficulty = u64;

/// Easiest allowed target: 0x00000000ffff0000...00
pub const POW_LIMIT: Uint256 = Uint256([
    0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
]);

/// Reported for a zero target, where the quotient is undefined.
pub const MAX_DIFFICULTY: Difficulty = 10_000_000_000_000_000_000;

/// `floor(POW_LIMIT / d)`, with difficulty 0 mapping to `POW_LIMIT` itself.
pub fn difficulty_to_target(difficulty: Difficulty) -> Uint256 {
    if difficulty == 0 {
        return POW_LIMIT;
    }
    let quotient = POW_LIMIT.to_biguint() / BigUint::from(difficulty);
    Uint256::from_biguint(&quotient).unwrap_or(POW_LIMIT)
}

/// `floor(POW_LIMIT / t)`. A quotient wider than 64 bits saturates at `u64::MAX`.
pub fn target_to_difficulty(target: &Uint256) -> Difficulty {
    if target.is_zero() {
        return MAX_DIFFICULTY;
    }
    let quotient = POW_LIMIT.to_biguint() / target.to_biguint();
    quotient.to_u64().unwrap_or(u64::MAX)
}

pub fn compare_targets(a: &Uint256, b: &Uint256) -> Ordering {
    a.cmp(b)
}

/// Decode a compact target as it appears in the header field.
///
/// After a byte swap the top byte is the number of significant bytes and the
/// low three bytes are the mantissa (sign bit masked off).
pub fn compact_to_target(compact: u32) -> Result<Uint256> {
    let x = compact.swap_bytes();
    let size = (x >> 24) as usize;
    if size > 32 {
        return Err(ProxyError::InvalidCompactTarget(compact));
    }

    let mantissa = [
        ((x >> 16) & 0x7f) as u8,
        ((x >> 8) & 0xff) as u8,
        (x & 0xff) as u8,
    ];
    let n = size.min(mantissa.len());

    let mut out = [0u8; 32];
    let start = 32 - size;
    out[start..start + n].copy_from_slice(&mantissa[..n]);
    Ok(Uint256(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_difficulty_is_pow_limit() {
        assert_eq!(difficulty_to_target(0), POW_LIMIT);
        assert_eq!(difficulty_to_target(1), POW_LIMIT);
    }

    #[test]
    fn test_difficulty_round_trip() {
        let samples = [
            1u64,
            2,
            3,
            5,
            17,
            257,
            1_000,
            65_535,
            1 << 20,
            123_456_789,
            10_000_000_000,
            MAX_DIFFICULTY - 1,
            MAX_DIFFICULTY,
            MAX_DIFFICULTY + 1,
            15_000_000_000_000_000_000,
            u64::MAX - 1,
            u64::MAX,
        ];
        for d in samples {
            let target = difficulty_to_target(d);
            assert_eq!(target_to_difficulty(&target), d, "difficulty {}", d);
        }
    }

    #[test]
    fn test_harder_difficulty_gives_smaller_target() {
        let easy = difficulty_to_target(100);
        let hard = difficulty_to_target(1_000);
        assert_eq!(compare_targets(&hard, &easy), Ordering::Less);
        assert_eq!(compare_targets(&easy, &hard), Ordering::Greater);
        assert_eq!(compare_targets(&easy, &easy), Ordering::Equal);
    }

    #[test]
    fn test_exact_division_of_pow_limit() {
        // 0xffff / 0xffff leaves 0x0000...01 followed by 208 zero bits.
        let t = difficulty_to_target(0xffff);
        let mut expected = [0u8; 32];
        expected[5] = 0x01;
        assert_eq!(t, Uint256(expected));
    }

    #[test]
    fn test_target_to_difficulty_edges() {
        assert_eq!(target_to_difficulty(&Uint256::ZERO), MAX_DIFFICULTY);
        assert_eq!(target_to_difficulty(&Uint256::MAX), 0);

        let mut one = [0u8; 32];
        one[31] = 1;
        assert_eq!(target_to_difficulty(&Uint256(one)), u64::MAX);
    }

    #[test]
    fn test_difficulties_above_sentinel_are_not_clamped() {
        let d = 15_000_000_000_000_000_000u64;
        assert!(d > MAX_DIFFICULTY);
        assert_eq!(target_to_difficulty(&difficulty_to_target(d)), d);
        assert_ne!(target_to_difficulty(&difficulty_to_target(d)), MAX_DIFFICULTY);
    }

    #[test]
    fn test_compact_three_significant_bytes() {
        // Swapped: 0x03123456
        let t = compact_to_target(0x5634_1203).unwrap();
        let mut expected = [0u8; 32];
        expected[29..].copy_from_slice(&[0x12, 0x34, 0x56]);
        assert_eq!(t, Uint256(expected));
    }

    #[test]
    fn test_compact_short_and_masked() {
        // Swapped: 0x01123456, only one significant byte survives.
        let t = compact_to_target(0x5634_1201).unwrap();
        let mut expected = [0u8; 32];
        expected[31] = 0x12;
        assert_eq!(t, Uint256(expected));

        // Swapped: 0x03ff0000, the sign bit is masked off.
        let t = compact_to_target(0x0000_ff03).unwrap();
        let mut expected = [0u8; 32];
        expected[29] = 0x7f;
        assert_eq!(t, Uint256(expected));

        assert_eq!(compact_to_target(0).unwrap(), Uint256::ZERO);
    }

    #[test]
    fn test_compact_matches_pow_limit() {
        // 0x1d00ffff in header byte order.
        assert_eq!(compact_to_target(0xffff_001d).unwrap(), POW_LIMIT);
    }

    #[test]
    fn test_compact_too_wide() {
        // Swapped: 0x21000000 -> 33 significant bytes.
        let err = compact_to_target(0x0000_0021).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidCompactTarget(0x21)));

        assert!(compact_to_target(0x0000_0020).is_ok());
    }
}
