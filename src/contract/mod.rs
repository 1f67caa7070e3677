//! Contract state model.
//!
//! A dMint contract lives in a single UTXO whose locking script carries a
//! pushed state prologue in front of a fixed bytecode tail. The state
//! advances by one height per successful mint and burns at `max_height`.

pub mod script;

use crate::algo::{Algorithm, Target};

pub const REF_LEN: usize = 36;

/// 36-byte identity: a txid plus a 4-byte little-endian output index.
pub type ContractRef = [u8; REF_LEN];

/// Build a reference from its txid and output index.
pub fn make_ref(txid: &[u8; 32], vout: u32) -> ContractRef {
    let mut r = [0u8; REF_LEN];
    r[..32].copy_from_slice(txid);
    r[32..].copy_from_slice(&vout.to_le_bytes());
    r
}

/// The UTXO currently carrying a piece of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: [u8; 32], vout: u32) -> Self {
        OutPoint { txid, vout }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut display = self.txid;
        display.reverse();
        write!(f, "{}:{}", hex::encode(display), self.vout)
    }
}

/// The state fields pushed in the script prologue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHeader {
    pub height: u64,
    pub contract_ref: ContractRef,
    pub token_ref: ContractRef,
    pub max_height: u64,
    pub reward: u64,
    pub target: Target,
    pub algorithm: Algorithm,
    /// v2 contracts: unix seconds of the previous mint.
    pub last_time: Option<u32>,
    /// v2 contracts: seconds per block the DAA aims for.
    pub target_time: Option<u64>,
}

impl StateHeader {
    /// Legacy contracts push no algorithm id and carry a 64-bit target.
    pub fn is_v1(&self) -> bool {
        self.algorithm == Algorithm::Sha256d
            && self.last_time.is_none()
            && self.target_time.is_none()
            && matches!(self.target, Target::Legacy(_))
    }

    pub fn validate(&self) -> Result<(), script::ScriptError> {
        if self.height > self.max_height {
            return Err(script::ScriptError::StateInvariant("height exceeds max height"));
        }
        if self.max_height == 0 {
            return Err(script::ScriptError::StateInvariant("max height must be positive"));
        }
        if self.reward == 0 {
            return Err(script::ScriptError::StateInvariant("reward must be positive"));
        }
        let target_ok = match self.target {
            Target::Legacy(t) => t > 0,
            Target::Full(t) => !t.is_zero(),
        };
        if !target_ok {
            return Err(script::ScriptError::StateInvariant("target must be positive"));
        }
        Ok(())
    }
}

/// A fully located contract state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractState {
    pub header: StateHeader,
    pub location: OutPoint,
    /// Annotation from a sibling message output, when present.
    pub message: Option<String>,
}

impl ContractState {
    pub fn new(header: StateHeader, location: OutPoint) -> Self {
        ContractState { header, location, message: None }
    }

    /// The contract burned once height reaches the cap.
    pub fn is_burned(&self) -> bool {
        self.header.height >= self.header.max_height
    }

    /// Heights left to mint, including the terminal one.
    pub fn remaining(&self) -> u64 {
        self.header.max_height.saturating_sub(self.header.height)
    }
}
