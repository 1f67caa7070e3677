//! Difficulty-adjustment engine.
//!
//! Five deterministic modes over integer fixed-point arithmetic. Outputs
//! are compared against on-chain expectations, so no floating point is
//! allowed anywhere in here: Epoch and LWMA scale by `PRECISION` (10^6),
//! ASERT works in a 2^16 radix the way the aserti3 family does.

use std::collections::VecDeque;

use crate::algo::{Target, TargetFormat};

/// Fixed-point precision for Epoch and LWMA.
pub const PRECISION: u128 = 1_000_000;

/// Fixed-point radix for ASERT.
pub const RADIX: i128 = 1 << 16;

/// round(ln(2) * RADIX).
pub const LN2_SCALED: i128 = 45_426;

/// Bounded history length for the LWMA window.
pub const MAX_HISTORY: usize = 1000;

/// Largest exponent magnitude fed to the fixed-point exponential.
const EXP_CLAMP: i128 = 4 * RADIX;

#[derive(Debug, thiserror::Error)]
pub enum DaaError {
    #[error("unknown DAA mode id: 0x{0:02x}")]
    UnknownMode(u8),

    #[error("invalid DAA parameters: {0}")]
    InvalidParams(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaaMode {
    Fixed = 0x00,
    Epoch = 0x01,
    Asert = 0x02,
    Lwma = 0x03,
    Schedule = 0x04,
}

impl DaaMode {
    pub fn from_id(id: u8) -> Result<Self, DaaError> {
        match id {
            0x00 => Ok(DaaMode::Fixed),
            0x01 => Ok(DaaMode::Epoch),
            0x02 => Ok(DaaMode::Asert),
            0x03 => Ok(DaaMode::Lwma),
            0x04 => Ok(DaaMode::Schedule),
            other => Err(DaaError::UnknownMode(other)),
        }
    }

    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            DaaMode::Fixed => "fixed",
            DaaMode::Epoch => "epoch",
            DaaMode::Asert => "asert",
            DaaMode::Lwma => "lwma",
            DaaMode::Schedule => "schedule",
        }
    }
}

/// A schedule breakpoint: from `height` on, difficulty is `difficulty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub height: u64,
    pub difficulty: u128,
}

#[derive(Debug, Clone)]
pub struct DaaParams {
    pub mode: DaaMode,
    /// Seconds per block the contract aims for.
    pub target_block_time: u64,
    /// Epoch mode: blocks per adjustment window.
    pub epoch_length: u64,
    /// Epoch mode: per-window adjustment bound M.
    pub max_adjustment: u128,
    /// ASERT: half life in seconds.
    pub half_life: u64,
    /// ASERT: optional softening asymptote, 0 disables.
    pub asymptote: u128,
    /// LWMA: window size in blocks.
    pub window_size: usize,
    /// Schedule mode breakpoints.
    pub schedule: Vec<Breakpoint>,
}

impl Default for DaaParams {
    fn default() -> Self {
        DaaParams {
            mode: DaaMode::Fixed,
            target_block_time: 300,
            epoch_length: 100,
            max_adjustment: 4,
            half_life: 3600,
            asymptote: 0,
            window_size: 45,
            schedule: Vec::new(),
        }
    }
}

impl DaaParams {
    pub fn validate(&self) -> Result<(), DaaError> {
        if self.target_block_time == 0 {
            return Err(DaaError::InvalidParams("target block time must be positive"));
        }
        match self.mode {
            DaaMode::Epoch => {
                if self.epoch_length == 0 {
                    return Err(DaaError::InvalidParams("epoch length must be positive"));
                }
                if self.max_adjustment < 2 {
                    return Err(DaaError::InvalidParams("max adjustment must be at least 2"));
                }
            }
            DaaMode::Asert => {
                if self.half_life == 0 {
                    return Err(DaaError::InvalidParams("half life must be positive"));
                }
            }
            DaaMode::Lwma => {
                if self.window_size == 0 {
                    return Err(DaaError::InvalidParams("window size must be positive"));
                }
            }
            DaaMode::Schedule => {
                if self.schedule.is_empty() {
                    return Err(DaaError::InvalidParams("schedule must not be empty"));
                }
                let mut last = None;
                for bp in &self.schedule {
                    if bp.difficulty == 0 {
                        return Err(DaaError::InvalidParams("schedule difficulty must be positive"));
                    }
                    if let Some(prev) = last {
                        if bp.height <= prev {
                            return Err(DaaError::InvalidParams(
                                "schedule heights must be strictly increasing",
                            ));
                        }
                    }
                    last = Some(bp.height);
                }
            }
            DaaMode::Fixed => {}
        }
        Ok(())
    }
}

/// Per-contract adjustment state: the current difficulty, the anchors the
/// individual modes key off, and the bounded LWMA history.
#[derive(Debug, Clone)]
pub struct DaaState {
    pub difficulty: u128,
    pub last_height: u64,
    pub last_time: u64,
    pub anchor_height: u64,
    pub anchor_time: u64,
    pub anchor_difficulty: u128,
    pub epoch_start_height: u64,
    pub epoch_start_time: u64,
    pub block_times: VecDeque<u64>,
    pub difficulties: VecDeque<u128>,
}

impl DaaState {
    pub fn new(initial_difficulty: u128, height: u64, time: u64) -> Self {
        let difficulty = initial_difficulty.max(1);
        let mut block_times = VecDeque::new();
        block_times.push_back(time);
        let mut difficulties = VecDeque::new();
        difficulties.push_back(difficulty);
        DaaState {
            difficulty,
            last_height: height,
            last_time: time,
            anchor_height: height,
            anchor_time: time,
            anchor_difficulty: difficulty,
            epoch_start_height: height,
            epoch_start_time: time,
            block_times,
            difficulties,
        }
    }

    /// Pure next-difficulty function. Does not mutate state.
    pub fn next_difficulty(&self, params: &DaaParams, new_height: u64, new_time: u64) -> u128 {
        let next = match params.mode {
            DaaMode::Fixed => self.anchor_difficulty,
            DaaMode::Epoch => self.next_epoch(params, new_height, new_time),
            DaaMode::Asert => self.next_asert(params, new_height, new_time),
            DaaMode::Lwma => self.next_lwma(params, new_time),
            DaaMode::Schedule => self.next_schedule(params, new_height),
        };
        next.max(1)
    }

    /// Apply a transition: compute the next difficulty and roll the
    /// anchors and history forward.
    pub fn advance(&mut self, params: &DaaParams, new_height: u64, new_time: u64) -> u128 {
        let next = self.next_difficulty(params, new_height, new_time);

        if params.mode == DaaMode::Epoch
            && params.epoch_length > 0
            && new_height % params.epoch_length == 0
        {
            self.epoch_start_height = new_height;
            self.epoch_start_time = new_time;
        }

        self.block_times.push_back(new_time);
        self.difficulties.push_back(next);
        while self.block_times.len() > MAX_HISTORY {
            self.block_times.pop_front();
        }
        while self.difficulties.len() > MAX_HISTORY {
            self.difficulties.pop_front();
        }

        self.last_height = new_height;
        self.last_time = new_time;
        self.difficulty = next;
        next
    }

    /// The target for the current difficulty under a format.
    pub fn target(&self, format: TargetFormat) -> Target {
        Target::from_difficulty(format, self.difficulty)
    }

    fn next_epoch(&self, params: &DaaParams, new_height: u64, new_time: u64) -> u128 {
        if new_height % params.epoch_length != 0 {
            return self.difficulty;
        }
        let expected = (params.epoch_length as u128) * (params.target_block_time as u128);
        let actual = new_time.saturating_sub(self.epoch_start_time).max(1) as u128;

        let m = params.max_adjustment.max(2);
        let adj_scaled = (expected * PRECISION / actual).clamp(PRECISION / m, PRECISION * m);
        (self.difficulty * adj_scaled / PRECISION).max(1)
    }

    fn next_asert(&self, params: &DaaParams, new_height: u64, new_time: u64) -> u128 {
        let time_delta = new_time as i128 - self.anchor_time as i128;
        let height_delta = new_height as i128 - self.anchor_height as i128;
        let expected = height_delta * params.target_block_time as i128;

        let denom = params.half_life as i128;
        let exponent = ((time_delta - expected) * LN2_SCALED / denom).clamp(-EXP_CLAMP, EXP_CLAMP);

        // Positive exponent means the chain ran slower than scheduled and
        // difficulty eases off; negative means it ran hot and difficulty
        // rises. The exponential is evaluated on the magnitude only, where
        // the cubic expansion is well behaved.
        let factor = fx_exp(exponent.abs());
        let next = if exponent >= 0 {
            ((self.anchor_difficulty as i128) * RADIX / factor).max(1) as u128
        } else {
            ((self.anchor_difficulty as i128).saturating_mul(factor) / RADIX).max(1) as u128
        };

        if params.asymptote > 0 && next > params.asymptote {
            params.asymptote + (next - params.asymptote) / 2
        } else {
            next
        }
    }

    fn next_lwma(&self, params: &DaaParams, new_time: u64) -> u128 {
        let mut times: Vec<u64> = self.block_times.iter().copied().collect();
        times.push(new_time);

        let available = times.len().saturating_sub(1);
        let n = available.min(params.window_size);
        if n == 0 {
            return self.difficulty;
        }

        let max_solve = 6 * params.target_block_time as u128;
        let start = times.len() - 1 - n;

        let mut weighted_sum: u128 = 0;
        let mut weight_sum: u128 = 0;
        for (k, w) in times.windows(2).skip(start).take(n).zip(1..=n as u128) {
            let solve = (k[1].saturating_sub(k[0]) as u128).clamp(1, max_solve);
            weighted_sum += solve * w;
            weight_sum += w;
        }

        let weighted_mean = (weighted_sum / weight_sum).max(1);
        let adj_scaled = ((params.target_block_time as u128) * PRECISION / weighted_mean)
            .clamp(PRECISION / 3, PRECISION * 3);
        (self.difficulty * adj_scaled / PRECISION).max(1)
    }

    fn next_schedule(&self, params: &DaaParams, new_height: u64) -> u128 {
        let mut current = params
            .schedule
            .first()
            .map(|bp| bp.difficulty)
            .unwrap_or(self.difficulty);
        for bp in &params.schedule {
            if bp.height <= new_height {
                current = bp.difficulty;
            } else {
                break;
            }
        }
        current
    }
}

/// Fixed-point e^x in the 2^16 radix, cubic expansion:
/// R + x + x^2/2R + x^3/6R^2, with x clamped to [0, 4R].
///
/// Callers pass magnitudes only; the negative side is handled by
/// reciprocal scaling at the call site.
pub fn fx_exp(x: i128) -> i128 {
    let x = x.clamp(0, EXP_CLAMP);
    RADIX + x + x * x / (2 * RADIX) + x * x * x / (6 * RADIX * RADIX)
}
