//! Decoded token metadata consumed for display and engine configuration.
//!
//! The CBOR envelope itself is decoded by the shell; the core receives
//! this plain view through the discovery adapter, reads the mining fields
//! and falls back to double SHA-256 with a fixed difficulty when they are
//! absent or malformed.

use serde::{Deserialize, Serialize};

use crate::algo::Algorithm;
use crate::daa::{Breakpoint, DaaMode, DaaParams};

/// Protocol tags a mineable token must carry.
pub const PROTOCOL_FT: u64 = 1;
pub const PROTOCOL_DMINT: u64 = 4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// The `p` protocol list.
    #[serde(default)]
    pub protocols: Vec<u64>,
    /// The optional `v` version string.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub dmint: Option<DmintInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DmintInfo {
    #[serde(default)]
    pub algo: Option<u8>,
    #[serde(default)]
    pub max_height: Option<u64>,
    #[serde(default)]
    pub reward: Option<u64>,
    #[serde(default)]
    pub premine: Option<u64>,
    #[serde(default)]
    pub diff: Option<u128>,
    #[serde(default)]
    pub daa: Option<DaaInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaaInfo {
    #[serde(default)]
    pub mode: Option<u8>,
    #[serde(default)]
    pub target_time: Option<u64>,
    #[serde(default)]
    pub epoch_length: Option<u64>,
    #[serde(default)]
    pub max_adjustment: Option<u128>,
    #[serde(default)]
    pub half_life: Option<u64>,
    #[serde(default)]
    pub window_size: Option<usize>,
    #[serde(default)]
    pub asymptote: Option<u128>,
    /// Schedule breakpoints as `(height, difficulty)` pairs.
    #[serde(default)]
    pub schedule: Vec<(u64, u128)>,
}

/// The configuration the engine derives from a token.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub algorithm: Algorithm,
    pub initial_difficulty: u128,
    pub daa: DaaParams,
}

impl TokenMetadata {
    /// A token is mineable when it declares both the fungible-token and
    /// the decentralized-mint protocols.
    pub fn is_mineable(&self) -> bool {
        self.protocols.contains(&PROTOCOL_FT) && self.protocols.contains(&PROTOCOL_DMINT)
    }

    /// Derive the engine configuration. Missing or unparseable fields
    /// fall back to double SHA-256 with a fixed unit difficulty.
    pub fn engine_config(&self) -> EngineConfig {
        let dmint = self.dmint.as_ref();

        let algorithm = dmint
            .and_then(|d| d.algo)
            .and_then(|id| Algorithm::from_id(id).ok())
            .unwrap_or(Algorithm::Sha256d);

        let initial_difficulty = dmint.and_then(|d| d.diff).unwrap_or(1).max(1);

        let defaults = DaaParams::default();
        let daa = match dmint.and_then(|d| d.daa.as_ref()) {
            Some(info) => {
                let mode = info
                    .mode
                    .and_then(|id| DaaMode::from_id(id).ok())
                    .unwrap_or(DaaMode::Fixed);
                DaaParams {
                    mode,
                    target_block_time: info.target_time.unwrap_or(defaults.target_block_time),
                    epoch_length: info.epoch_length.unwrap_or(defaults.epoch_length),
                    max_adjustment: info.max_adjustment.unwrap_or(defaults.max_adjustment),
                    half_life: info.half_life.unwrap_or(defaults.half_life),
                    window_size: info.window_size.unwrap_or(defaults.window_size),
                    asymptote: info.asymptote.unwrap_or(0),
                    schedule: info
                        .schedule
                        .iter()
                        .map(|&(height, difficulty)| Breakpoint { height, difficulty })
                        .collect(),
                }
            }
            None => defaults,
        };

        EngineConfig { algorithm, initial_difficulty, daa }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mineable_requires_both_protocols() {
        let mut meta = TokenMetadata { protocols: vec![1], ..Default::default() };
        assert!(!meta.is_mineable());
        meta.protocols = vec![1, 4];
        assert!(meta.is_mineable());
        meta.protocols = vec![4, 2];
        assert!(!meta.is_mineable());
    }

    #[test]
    fn test_fallback_configuration() {
        let meta = TokenMetadata::default();
        let config = meta.engine_config();
        assert_eq!(config.algorithm, Algorithm::Sha256d);
        assert_eq!(config.initial_difficulty, 1);
        assert_eq!(config.daa.mode, DaaMode::Fixed);
    }

    #[test]
    fn test_dmint_fields_selected() {
        let meta = TokenMetadata {
            protocols: vec![1, 4],
            dmint: Some(DmintInfo {
                algo: Some(0x01),
                diff: Some(50_000),
                daa: Some(DaaInfo {
                    mode: Some(0x03),
                    target_time: Some(120),
                    window_size: Some(30),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = meta.engine_config();
        assert_eq!(config.algorithm, Algorithm::Blake3);
        assert_eq!(config.initial_difficulty, 50_000);
        assert_eq!(config.daa.mode, DaaMode::Lwma);
        assert_eq!(config.daa.target_block_time, 120);
        assert_eq!(config.daa.window_size, 30);
    }

    #[test]
    fn test_unknown_ids_fall_back() {
        let meta = TokenMetadata {
            protocols: vec![1, 4],
            dmint: Some(DmintInfo {
                algo: Some(0xee),
                daa: Some(DaaInfo { mode: Some(0xee), ..Default::default() }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = meta.engine_config();
        assert_eq!(config.algorithm, Algorithm::Sha256d);
        assert_eq!(config.daa.mode, DaaMode::Fixed);
    }
}
