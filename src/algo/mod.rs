/// Mining algorithm registry
///
/// Maps the on-chain algorithm id to everything the search engine needs:
/// the device kernel source, dispatch geometry, midstate shape and the
/// target format the contract variant compares against.

pub mod preimage;
pub mod verify;

pub use preimage::{midstate_for, Midstate, Preimage};

use primitive_types::U256;

/// Largest target expressible by the legacy 64-bit contract variant.
pub const MAX_TARGET_LEGACY: u64 = i64::MAX as u64;

/// Registry and lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum AlgoError {
    #[error("unknown algorithm id: 0x{0:02x}")]
    UnknownId(u8),

    #[error("unsupported algorithm: {0}")]
    Unsupported(Algorithm),
}

/// The closed set of hash families a dMint contract can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    /// Double SHA-256, legacy 64-bit target contracts.
    Sha256d = 0x00,
    /// BLAKE3, full 256-bit target.
    Blake3 = 0x01,
    /// KangarooTwelve, full 256-bit target.
    K12 = 0x02,
    /// Argon2id-Light. Recognized but refused until its on-chain definition freezes.
    Argon2Light = 0x03,
}

impl Algorithm {
    pub fn from_id(id: u8) -> Result<Self, AlgoError> {
        match id {
            0x00 => Ok(Algorithm::Sha256d),
            0x01 => Ok(Algorithm::Blake3),
            0x02 => Ok(Algorithm::K12),
            0x03 => Ok(Algorithm::Argon2Light),
            other => Err(AlgoError::UnknownId(other)),
        }
    }

    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256d => "sha256d",
            Algorithm::Blake3 => "blake3",
            Algorithm::K12 => "k12",
            Algorithm::Argon2Light => "argon2id-light",
        }
    }

    pub fn target_format(&self) -> TargetFormat {
        match self {
            Algorithm::Sha256d => TargetFormat::LegacyV1,
            _ => TargetFormat::Full256,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a hash is compared against the contract target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    /// First four hash bytes must be zero, bytes 4..12 compared as a
    /// big-endian u64 against a 64-bit target.
    LegacyV1,
    /// Full 32-byte hash compared big-endian against a 256-bit target.
    Full256,
}

impl TargetFormat {
    /// u32 words occupied in the device target buffer.
    pub fn word_count(&self) -> usize {
        match self {
            TargetFormat::LegacyV1 => 3,
            TargetFormat::Full256 => 8,
        }
    }
}

/// A contract target in the representation its format dictates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Legacy(u64),
    Full(U256),
}

impl Target {
    /// Convert a difficulty to the target for the given format.
    /// Difficulty below 1 is treated as 1.
    pub fn from_difficulty(format: TargetFormat, difficulty: u128) -> Target {
        let d = difficulty.max(1);
        match format {
            TargetFormat::LegacyV1 => {
                let d = u64::try_from(d).unwrap_or(u64::MAX).max(1);
                Target::Legacy((MAX_TARGET_LEGACY / d).max(1))
            }
            TargetFormat::Full256 => Target::Full(U256::MAX / U256::from(d)),
        }
    }

    /// Approximate difficulty this target corresponds to.
    pub fn difficulty(&self) -> u128 {
        match self {
            Target::Legacy(t) => (MAX_TARGET_LEGACY as u128 / (*t).max(1) as u128).max(1),
            Target::Full(t) => {
                if t.is_zero() {
                    return u128::MAX;
                }
                let ratio = U256::MAX / *t;
                if ratio > U256::from(u128::MAX) {
                    u128::MAX
                } else {
                    ratio.as_u128().max(1)
                }
            }
        }
    }

    pub fn format(&self) -> TargetFormat {
        match self {
            Target::Legacy(_) => TargetFormat::LegacyV1,
            Target::Full(_) => TargetFormat::Full256,
        }
    }

    /// The u32 words written to the device target buffer.
    ///
    /// Legacy layout is `[0, hi32, lo32]`; Full256 is eight words most
    /// significant first. The kernels byte-swap their little-endian hash
    /// words before comparing against these.
    pub fn device_words(&self) -> Vec<u32> {
        match self {
            Target::Legacy(t) => vec![0, (*t >> 32) as u32, *t as u32],
            Target::Full(t) => {
                let mut be = [0u8; 32];
                t.to_big_endian(&mut be);
                (0..8)
                    .map(|i| {
                        u32::from_be_bytes([be[4 * i], be[4 * i + 1], be[4 * i + 2], be[4 * i + 3]])
                    })
                    .collect()
            }
        }
    }
}

/// Everything the device driver needs to run one algorithm.
#[derive(Debug, Clone, Copy)]
pub struct AlgoSpec {
    pub algorithm: Algorithm,
    /// OpenCL kernel source, compiled at runtime.
    pub kernel_source: &'static str,
    pub kernel_name: &'static str,
    /// Threads per workgroup.
    pub workgroup_size: u32,
    /// Result slots in the device hit buffer.
    pub result_slots: u32,
    /// Bytes of midstate uploaded per work change.
    pub midstate_len: usize,
    pub target_format: TargetFormat,
}

const SHA256D_SPEC: AlgoSpec = AlgoSpec {
    algorithm: Algorithm::Sha256d,
    kernel_source: include_str!("../engine/kernels/sha256d.cl"),
    kernel_name: "search_sha256d",
    workgroup_size: 256,
    result_slots: 128,
    midstate_len: 32,
    target_format: TargetFormat::LegacyV1,
};

const BLAKE3_SPEC: AlgoSpec = AlgoSpec {
    algorithm: Algorithm::Blake3,
    kernel_source: include_str!("../engine/kernels/blake3.cl"),
    kernel_name: "search_blake3",
    workgroup_size: 256,
    result_slots: 128,
    midstate_len: 64,
    target_format: TargetFormat::Full256,
};

const K12_SPEC: AlgoSpec = AlgoSpec {
    algorithm: Algorithm::K12,
    kernel_source: include_str!("../engine/kernels/k12.cl"),
    kernel_name: "search_k12",
    workgroup_size: 256,
    result_slots: 128,
    midstate_len: 64,
    target_format: TargetFormat::Full256,
};

/// Resolve the device spec for an algorithm.
///
/// Argon2id-Light is registered but refused: the reference material ships
/// two incompatible definitions and the feature is marked deferred.
pub fn spec_for(algorithm: Algorithm) -> Result<&'static AlgoSpec, AlgoError> {
    match algorithm {
        Algorithm::Sha256d => Ok(&SHA256D_SPEC),
        Algorithm::Blake3 => Ok(&BLAKE3_SPEC),
        Algorithm::K12 => Ok(&K12_SPEC),
        Algorithm::Argon2Light => Err(AlgoError::Unsupported(Algorithm::Argon2Light)),
    }
}
