//! Canonical preimage and per-algorithm midstate construction.
//!
//! Every dMint variant hashes the same 72-byte input: a 64-byte preimage
//! derived from the contract's current location and the miner's scripts,
//! followed by the 8-byte nonce. The midstate lets the device skip the
//! fixed prefix and finalize over the nonce only.

use sha2::{Digest, Sha256};

use super::{Algorithm, AlgoError};

pub const PREIMAGE_LEN: usize = 64;
pub const NONCE_LEN: usize = 8;
pub const HASH_INPUT_LEN: usize = PREIMAGE_LEN + NONCE_LEN;

/// SHA256(SHA256(data)).
#[inline]
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Single SHA256.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// The fixed 64-byte prefix of the proof-of-work input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preimage([u8; PREIMAGE_LEN]);

impl Preimage {
    /// Build the preimage for one contract location.
    ///
    /// `location_txid` is the txid in wire order; it is byte-reversed
    /// before hashing, matching the on-chain covenant.
    pub fn build(
        location_txid: &[u8; 32],
        contract_ref: &[u8; 36],
        input_script: &[u8],
        output_script: &[u8],
    ) -> Self {
        let mut reversed = *location_txid;
        reversed.reverse();

        let mut head = Vec::with_capacity(32 + 36);
        head.extend_from_slice(&reversed);
        head.extend_from_slice(contract_ref);

        let mut tail = Vec::with_capacity(64);
        tail.extend_from_slice(&sha256d(input_script));
        tail.extend_from_slice(&sha256d(output_script));

        let mut bytes = [0u8; PREIMAGE_LEN];
        bytes[..32].copy_from_slice(&sha256(&head));
        bytes[32..].copy_from_slice(&sha256(&tail));
        Preimage(bytes)
    }

    pub fn from_bytes(bytes: [u8; PREIMAGE_LEN]) -> Self {
        Preimage(bytes)
    }

    pub fn bytes(&self) -> &[u8; PREIMAGE_LEN] {
        &self.0
    }

    /// The full 72-byte hash input for a nonce. The nonce is appended
    /// little-endian, low half first, as the device writes it.
    pub fn hash_input(&self, nonce: u64) -> [u8; HASH_INPUT_LEN] {
        let mut input = [0u8; HASH_INPUT_LEN];
        input[..PREIMAGE_LEN].copy_from_slice(&self.0);
        input[PREIMAGE_LEN..].copy_from_slice(&nonce.to_le_bytes());
        input
    }

    /// The preimage as 16 little-endian u32 words, the layout the BLAKE3
    /// and K12 kernels absorb directly.
    pub fn words_le(&self) -> [u32; 16] {
        let mut words = [0u32; 16];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_le_bytes([
                self.0[4 * i],
                self.0[4 * i + 1],
                self.0[4 * i + 2],
                self.0[4 * i + 3],
            ]);
        }
        words
    }
}

/// Per-algorithm precomputed state uploaded to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Midstate {
    /// SHA-256 chaining state after compressing the preimage block.
    Sha256([u32; 8]),
    /// The raw preimage as 16 little-endian words; the kernel runs the
    /// first compression itself.
    Words([u32; 16]),
}

impl Midstate {
    /// Words in upload order for the device midstate buffer.
    pub fn device_words(&self) -> Vec<u32> {
        match self {
            Midstate::Sha256(state) => state.to_vec(),
            Midstate::Words(words) => words.to_vec(),
        }
    }
}

/// Compute the midstate for the given algorithm.
pub fn midstate_for(algorithm: Algorithm, preimage: &Preimage) -> Result<Midstate, AlgoError> {
    match algorithm {
        Algorithm::Sha256d => Ok(Midstate::Sha256(sha256_compress_block(
            SHA256_IV,
            preimage.bytes(),
        ))),
        Algorithm::Blake3 | Algorithm::K12 => Ok(Midstate::Words(preimage.words_le())),
        Algorithm::Argon2Light => Err(AlgoError::Unsupported(Algorithm::Argon2Light)),
    }
}

/// SHA-256 initial state.
const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

const SHA256_K: [u32; 64] = [
    0x428a2f98, 0x71374491, 0xb5c0fbcf, 0xe9b5dba5, 0x3956c25b, 0x59f111f1, 0x923f82a4, 0xab1c5ed5,
    0xd807aa98, 0x12835b01, 0x243185be, 0x550c7dc3, 0x72be5d74, 0x80deb1fe, 0x9bdc06a7, 0xc19bf174,
    0xe49b69c1, 0xefbe4786, 0x0fc19dc6, 0x240ca1cc, 0x2de92c6f, 0x4a7484aa, 0x5cb0a9dc, 0x76f988da,
    0x983e5152, 0xa831c66d, 0xb00327c8, 0xbf597fc7, 0xc6e00bf3, 0xd5a79147, 0x06ca6351, 0x14292967,
    0x27b70a85, 0x2e1b2138, 0x4d2c6dfc, 0x53380d13, 0x650a7354, 0x766a0abb, 0x81c2c92e, 0x92722c85,
    0xa2bfe8a1, 0xa81a664b, 0xc24b8b70, 0xc76c51a3, 0xd192e819, 0xd6990624, 0xf40e3585, 0x106aa070,
    0x19a4c116, 0x1e376c08, 0x2748774c, 0x34b0bcb5, 0x391c0cb3, 0x4ed8aa4a, 0x5b9cca4f, 0x682e6ff3,
    0x748f82ee, 0x78a5636f, 0x84c87814, 0x8cc70208, 0x90befffa, 0xa4506ceb, 0xbef9a3f7, 0xc67178f2,
];

/// One SHA-256 compression round over a 64-byte block.
///
/// The `sha2` crate does not expose partial hashing state, and the device
/// only ever finalizes the second block, so the block transform is carried
/// here. Full digests elsewhere still go through `sha2`.
pub fn sha256_compress_block(state: [u32; 8], block: &[u8; 64]) -> [u32; 8] {
    let mut w = [0u32; 64];
    for (i, item) in w.iter_mut().take(16).enumerate() {
        *item = u32::from_be_bytes([
            block[4 * i],
            block[4 * i + 1],
            block[4 * i + 2],
            block[4 * i + 3],
        ]);
    }
    for i in 16..64 {
        let s0 = w[i - 15].rotate_right(7) ^ w[i - 15].rotate_right(18) ^ (w[i - 15] >> 3);
        let s1 = w[i - 2].rotate_right(17) ^ w[i - 2].rotate_right(19) ^ (w[i - 2] >> 10);
        w[i] = w[i - 16]
            .wrapping_add(s0)
            .wrapping_add(w[i - 7])
            .wrapping_add(s1);
    }

    let [mut a, mut b, mut c, mut d, mut e, mut f, mut g, mut h] = state;

    for i in 0..64 {
        let s1 = e.rotate_right(6) ^ e.rotate_right(11) ^ e.rotate_right(25);
        let ch = (e & f) ^ ((!e) & g);
        let t1 = h
            .wrapping_add(s1)
            .wrapping_add(ch)
            .wrapping_add(SHA256_K[i])
            .wrapping_add(w[i]);
        let s0 = a.rotate_right(2) ^ a.rotate_right(13) ^ a.rotate_right(22);
        let maj = (a & b) ^ (a & c) ^ (b & c);
        let t2 = s0.wrapping_add(maj);

        h = g;
        g = f;
        f = e;
        e = d.wrapping_add(t1);
        d = c;
        c = b;
        b = a;
        a = t1.wrapping_add(t2);
    }

    [
        state[0].wrapping_add(a),
        state[1].wrapping_add(b),
        state[2].wrapping_add(c),
        state[3].wrapping_add(d),
        state[4].wrapping_add(e),
        state[5].wrapping_add(f),
        state[6].wrapping_add(g),
        state[7].wrapping_add(h),
    ]
}
