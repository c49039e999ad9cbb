/// Base58check decoding and payout address validation

use num_bigint::BigUint;
use num_traits::Zero;

use super::sha256d;
use crate::error::Base58Error;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn digit(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u8)
}

/// Decode a base58check string and return the payload without its checksum.
pub fn base58check_decode(s: &str) -> Result<Vec<u8>, Base58Error> {
    let base = BigUint::from(58u32);
    let mut value = BigUint::zero();
    let mut leading_zeros = 0usize;
    let mut leading = true;

    for ch in s.chars() {
        let d = u8::try_from(ch)
            .ok()
            .and_then(digit)
            .ok_or(Base58Error::InvalidCharacter(ch))?;

        if d == 0 {
            if leading {
                leading_zeros += 1;
            }
        } else {
            leading = false;
        }

        value = value * &base + BigUint::from(d);
    }

    let mut data = vec![0u8; leading_zeros];
    if !value.is_zero() {
        data.extend_from_slice(&value.to_bytes_be());
    }

    if data.len() < 4 {
        return Err(Base58Error::TooShort);
    }

    let (payload, checksum) = data.split_at(data.len() - 4);
    let digest = sha256d(&[payload]);
    if checksum != &digest[..4] {
        return Err(Base58Error::Checksum);
    }

    Ok(payload.to_vec())
}

/// Returns `(valid, testnet)` for a miner payout address.
pub fn is_valid_address(addr: &str) -> (bool, bool) {
    let payload = match base58check_decode(addr) {
        Ok(p) => p,
        Err(_) => return (false, false),
    };

    match payload.len() {
        // version(2) + hash160
        22 => match (payload[0], payload[1]) {
            (0x1c, 0xbd | 0xb8) => (true, false),
            (0x1d, 0xba | 0x25) => (true, true),
            _ => (false, false),
        },
        // version(2) + two 32-byte keys
        66 => match (payload[0], payload[1]) {
            (0x16, 0x9a) => (true, false),
            (0x16, 0xb6) => (true, true),
            _ => (false, false),
        },
        _ => (false, false),
    }
}
