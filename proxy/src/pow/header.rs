use super::Uint256;

/// Header length when both nonce halves are 16 bytes.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 32 + 4 + 4 + 32;

/// Assemble the header preimage exactly as it is hashed.
///
/// Layout: version(BE) | prev | merkle | reserved | ntime(BE) | nbits(BE) | nonce1 | nonce2
#[allow(clippy::too_many_arguments)]
pub fn build_block_header(
    version: u32,
    prev_hash: &Uint256,
    merkle_root: &Uint256,
    reserved: &Uint256,
    ntime: u32,
    nbits: u32,
    nonce_part1: &[u8],
    nonce_part2: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 96 + 8 + nonce_part1.len() + nonce_part2.len());
    buf.extend_from_slice(&version.to_be_bytes());
    buf.extend_from_slice(prev_hash.as_bytes());
    buf.extend_from_slice(merkle_root.as_bytes());
    buf.extend_from_slice(reserved.as_bytes());
    buf.extend_from_slice(&ntime.to_be_bytes());
    buf.extend_from_slice(&nbits.to_be_bytes());
    buf.extend_from_slice(nonce_part1);
    buf.extend_from_slice(nonce_part2);
    buf
}

/// Variable-length size prefix written ahead of the solution.
pub fn compact_size(len: usize) -> Vec<u8> {
    let len = len as u64;
    match len {
        0..=0xfc => vec![len as u8],
        0xfd..=0xffff => {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(len as u16).to_le_bytes());
            v
        }
        0x1_0000..=0xffff_ffff => {
            let mut v = vec![0xfe];
            v.extend_from_slice(&(len as u32).to_le_bytes());
            v
        }
        _ => {
            let mut v = vec![0xff];
            v.extend_from_slice(&len.to_le_bytes());
            v
        }
    }
}
