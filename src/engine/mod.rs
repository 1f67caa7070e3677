/// Search engine core types and the device port.
///
/// The driver loop is device-agnostic; anything that can hold the four
/// storage buffers and dispatch a batch of threads implements
/// `SearchDevice` (hexagonal port, swappable backend).

pub mod driver;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::algo::{AlgoSpec, Algorithm, Midstate, Preimage, Target};

/// Smoothing factor of the hash-rate moving average.
pub const RATE_ALPHA: f64 = 0.15;

/// Device backend errors.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no compatible device available: {0}")]
    Unavailable(String),

    #[error("kernel build failed: {0}")]
    Build(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Everything the engine needs for one contract location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    /// Location txid in wire order; the preimage builder reverses it.
    pub location_txid: [u8; 32],
    pub contract_ref: [u8; 36],
    /// The miner's pay-to-pubkey-hash locking script.
    pub input_script: Vec<u8>,
    /// The annotation output script committed to by the claim.
    pub output_script: Vec<u8>,
    pub target: Target,
    pub algorithm: Algorithm,
}

impl Work {
    pub fn preimage(&self) -> Preimage {
        Preimage::build(
            &self.location_txid,
            &self.contract_ref,
            &self.input_script,
            &self.output_script,
        )
    }
}

/// A nonce that passed both the device predicate and host verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCandidate {
    pub nonce_hi: u32,
    pub nonce_lo: u32,
    pub hash: [u8; 32],
}

impl NonceCandidate {
    pub fn nonce(&self) -> u64 {
        ((self.nonce_hi as u64) << 32) | self.nonce_lo as u64
    }
}

/// One populated slot read back from the device hit buffer.
#[derive(Debug, Clone, Copy)]
pub struct ResultSlot {
    pub nonce_lo: u32,
    pub hash_w0: u32,
    pub hash_w1: u32,
}

/// Basic identification for logs and the startup banner.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_units: u32,
    pub max_workgroup_size: usize,
}

/// The device side of the engine: owns the kernel pipeline and the four
/// storage buffers (midstate, target, results, nonce offset).
pub trait SearchDevice: Send {
    /// Rebuild the pipeline for an algorithm and upload midstate/target.
    /// Called once per work change.
    fn configure(
        &mut self,
        spec: &AlgoSpec,
        midstate: &Midstate,
        target: &Target,
    ) -> Result<(), DeviceError>;

    /// Run one batch of `workgroups * spec.workgroup_size` threads from
    /// `nonce_offset`, blocking on the device queue, and return the
    /// populated hit slots.
    fn dispatch(&mut self, nonce_hi: u32, nonce_offset: u32, workgroups: u32)
        -> Result<Vec<ResultSlot>, DeviceError>;

    fn info(&self) -> DeviceInfo;
}

/// Engine lifecycle requested by the coordinator and observed by the
/// driver loop between dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineStatus {
    Ready = 0,
    Mining = 1,
    /// Re-read work and rewrite midstate/target without device teardown.
    Change = 2,
    Stop = 3,
}

impl EngineStatus {
    fn from_u8(v: u8) -> EngineStatus {
        match v {
            1 => EngineStatus::Mining,
            2 => EngineStatus::Change,
            3 => EngineStatus::Stop,
            _ => EngineStatus::Ready,
        }
    }
}

/// Shared handle between coordinator and driver: the status word, the
/// pending work slot and the smoothed hash rate.
#[derive(Clone)]
pub struct EngineHandle {
    status: Arc<AtomicU8>,
    work: Arc<Mutex<Option<Work>>>,
    rate_bits: Arc<AtomicU64>,
}

impl EngineHandle {
    pub fn new() -> Self {
        EngineHandle {
            status: Arc::new(AtomicU8::new(EngineStatus::Ready as u8)),
            work: Arc::new(Mutex::new(None)),
            rate_bits: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: EngineStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Install new work and ask the running loop to pick it up in place.
    /// If the loop is idle this arms it for the next start.
    pub fn request_change(&self, work: Work) {
        if let Ok(mut slot) = self.work.lock() {
            *slot = Some(work);
        }
        match self.status() {
            EngineStatus::Mining | EngineStatus::Change => self.set_status(EngineStatus::Change),
            _ => {}
        }
    }

    /// Install work and start mining.
    pub fn start(&self, work: Work) {
        if let Ok(mut slot) = self.work.lock() {
            *slot = Some(work);
        }
        self.set_status(EngineStatus::Change);
    }

    /// Ask the loop to wind down. It acknowledges by moving to `Ready`.
    pub fn request_stop(&self) {
        self.set_status(EngineStatus::Stop);
    }

    pub fn take_work(&self) -> Option<Work> {
        self.work.lock().ok().and_then(|slot| slot.clone())
    }

    /// Smoothed hashes per second.
    pub fn hash_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_hash_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential moving average of the instantaneous dispatch rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashRateEma {
    smoothed: f64,
    primed: bool,
}

impl HashRateEma {
    pub fn update(&mut self, instant: f64) -> f64 {
        if !self.primed {
            self.smoothed = instant;
            self.primed = true;
        } else {
            self.smoothed = (1.0 - RATE_ALPHA) * self.smoothed + RATE_ALPHA * instant;
        }
        self.smoothed
    }

    pub fn reset(&mut self) {
        self.smoothed = 0.0;
        self.primed = false;
    }

    pub fn value(&self) -> f64 {
        self.smoothed
    }
}
