//! Host-side candidate verification.
//!
//! The device predicate is treated as advisory: every nonce it reports is
//! recomputed here on the CPU before it may leave the engine. A candidate
//! that fails is a device false positive and is dropped without ceremony.

use primitive_types::U256;
use tiny_keccak::{Hasher, KangarooTwelve};

use super::preimage::{sha256d, Preimage, HASH_INPUT_LEN};
use super::{AlgoError, Algorithm, Target};

/// Compute the proof-of-work hash of a 72-byte input under an algorithm.
pub fn pow_hash(algorithm: Algorithm, input: &[u8; HASH_INPUT_LEN]) -> Result<[u8; 32], AlgoError> {
    match algorithm {
        Algorithm::Sha256d => Ok(sha256d(input)),
        Algorithm::Blake3 => Ok(*blake3::hash(input).as_bytes()),
        Algorithm::K12 => {
            let mut out = [0u8; 32];
            let mut k12 = KangarooTwelve::new(b"");
            k12.update(input);
            k12.finalize(&mut out);
            Ok(out)
        }
        Algorithm::Argon2Light => Err(AlgoError::Unsupported(Algorithm::Argon2Light)),
    }
}

/// Apply the target predicate to a hash.
pub fn meets_target(hash: &[u8; 32], target: &Target) -> bool {
    match target {
        Target::Legacy(t) => {
            if hash[..4] != [0, 0, 0, 0] {
                return false;
            }
            let window = u64::from_be_bytes([
                hash[4], hash[5], hash[6], hash[7], hash[8], hash[9], hash[10], hash[11],
            ]);
            window < *t
        }
        Target::Full(t) => U256::from_big_endian(hash) < *t,
    }
}

/// Recompute the hash for a nonce and check it against the target.
pub fn verify(
    algorithm: Algorithm,
    preimage: &Preimage,
    nonce: u64,
    target: &Target,
) -> Result<bool, AlgoError> {
    let hash = pow_hash(algorithm, &preimage.hash_input(nonce))?;
    Ok(meets_target(&hash, target))
}
