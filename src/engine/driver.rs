//! The cooperative device search loop.
//!
//! One loop owns one device. Between dispatches it observes the shared
//! status word: `change` rewrites midstate and target in place, `stop`
//! winds down and acknowledges with `ready`. Results from an in-flight
//! dispatch that raced a stop are discarded. Candidates leave the loop
//! host-verified and in strictly increasing nonce order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::algo::{self, verify, Preimage};
use crate::engine::{
    DeviceError, EngineHandle, EngineStatus, HashRateEma, NonceCandidate, SearchDevice, Work,
};

/// Poll interval while the engine sits idle without work.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Workgroups dispatched per iteration when the caller gives no hint.
pub const DEFAULT_WORKGROUPS: u32 = 1024;

pub struct SearchDriver {
    device: Arc<Mutex<Box<dyn SearchDevice>>>,
    handle: EngineHandle,
    candidates: mpsc::Sender<NonceCandidate>,
    workgroups: u32,
}

struct ActiveWork {
    work: Work,
    preimage: Preimage,
    threads_per_dispatch: u32,
    nonce_hi: u32,
    nonce_offset: u32,
}

impl SearchDriver {
    pub fn new(
        device: Box<dyn SearchDevice>,
        handle: EngineHandle,
        candidates: mpsc::Sender<NonceCandidate>,
        workgroups: Option<u32>,
    ) -> Self {
        SearchDriver {
            device: Arc::new(Mutex::new(device)),
            handle,
            candidates,
            workgroups: workgroups.unwrap_or(DEFAULT_WORKGROUPS).max(1),
        }
    }

    /// Drive the device until the candidate channel closes.
    pub async fn run(self) -> Result<(), DeviceError> {
        let mut rate = HashRateEma::default();
        let mut active: Option<ActiveWork> = None;

        loop {
            if self.candidates.is_closed() {
                tracing::debug!("candidate channel closed, search driver exiting");
                return Ok(());
            }

            match self.handle.status() {
                EngineStatus::Ready => {
                    tokio::time::sleep(IDLE_WAIT).await;
                }
                EngineStatus::Stop => {
                    active = None;
                    rate.reset();
                    self.handle.set_hash_rate(0.0);
                    self.handle.set_status(EngineStatus::Ready);
                    tracing::info!("search engine stopped");
                }
                EngineStatus::Change => {
                    match self.reload().await {
                        Ok(Some(next)) => {
                            active = Some(next);
                            self.handle.set_status(EngineStatus::Mining);
                        }
                        Ok(None) => {
                            // Change requested with no work installed.
                            self.handle.set_status(EngineStatus::Ready);
                        }
                        Err(e) => {
                            active = None;
                            self.handle.set_status(EngineStatus::Ready);
                            tracing::error!("work change failed: {}", e);
                        }
                    }
                }
                EngineStatus::Mining => {
                    let Some(current) = active.as_mut() else {
                        self.handle.set_status(EngineStatus::Ready);
                        continue;
                    };
                    let started = Instant::now();
                    let slots = self.dispatch_batch(current).await?;

                    // A stop or change that landed mid-dispatch invalidates
                    // this batch; the next loop turn handles the transition.
                    if self.handle.status() != EngineStatus::Mining {
                        continue;
                    }

                    self.forward_candidates(current, slots).await;

                    let count = current.threads_per_dispatch;
                    let (hi, lo) = advance_nonce(current.nonce_hi, current.nonce_offset, count);
                    current.nonce_hi = hi;
                    current.nonce_offset = lo;

                    let elapsed = started.elapsed().as_secs_f64().max(1e-9);
                    let smoothed = rate.update(count as f64 / elapsed);
                    self.handle.set_hash_rate(smoothed);
                }
            }
        }
    }

    async fn reload(&self) -> Result<Option<ActiveWork>, DeviceError> {
        let Some(work) = self.handle.take_work() else {
            return Ok(None);
        };
        let spec = algo::spec_for(work.algorithm)
            .map_err(|e| DeviceError::Build(e.to_string()))?;
        let preimage = work.preimage();
        let midstate = algo::midstate_for(work.algorithm, &preimage)
            .map_err(|e| DeviceError::Build(e.to_string()))?;

        {
            let device = self.device.clone();
            let target = work.target;
            let mid = midstate.clone();
            tokio::task::spawn_blocking(move || {
                device.blocking_lock().configure(spec, &mid, &target)
            })
            .await
            .map_err(|e| DeviceError::Dispatch(e.to_string()))??;
        }

        let threads_per_dispatch = self.workgroups * spec.workgroup_size;
        tracing::info!(
            algorithm = %work.algorithm,
            threads = threads_per_dispatch,
            "engine (re)configured"
        );
        Ok(Some(ActiveWork {
            work,
            preimage,
            threads_per_dispatch,
            nonce_hi: 0,
            nonce_offset: 0,
        }))
    }

    async fn dispatch_batch(
        &self,
        current: &mut ActiveWork,
    ) -> Result<Vec<crate::engine::ResultSlot>, DeviceError> {
        let device = self.device.clone();
        let (hi, offset, workgroups) =
            (current.nonce_hi, current.nonce_offset, self.workgroups);
        tokio::task::spawn_blocking(move || {
            device.blocking_lock().dispatch(hi, offset, workgroups)
        })
        .await
        .map_err(|e| DeviceError::Dispatch(e.to_string()))?
    }

    async fn forward_candidates(
        &self,
        current: &ActiveWork,
        mut slots: Vec<crate::engine::ResultSlot>,
    ) {
        if slots.is_empty() {
            return;
        }
        // Device threads append atomically in completion order; restore
        // nonce order before verification so downstream sees a sorted
        // stream.
        slots.sort_by_key(|s| s.nonce_lo);

        for slot in slots {
            let nonce = ((current.nonce_hi as u64) << 32) | slot.nonce_lo as u64;
            let verdict = verify::pow_hash(current.work.algorithm, &current.preimage.hash_input(nonce))
                .map(|hash| (verify::meets_target(&hash, &current.work.target), hash));
            match verdict {
                Ok((true, hash)) => {
                    let candidate = NonceCandidate {
                        nonce_hi: current.nonce_hi,
                        nonce_lo: slot.nonce_lo,
                        hash,
                    };
                    tracing::info!(
                        nonce = format_args!("{:016x}", candidate.nonce()),
                        "nonce verified"
                    );
                    if self.candidates.send(candidate).await.is_err() {
                        tracing::debug!("candidate receiver dropped");
                    }
                }
                Ok((false, _)) => {
                    // Device false positive, dropped without counting.
                    tracing::debug!(nonce_lo = slot.nonce_lo, "device candidate failed host check");
                }
                Err(e) => {
                    tracing::warn!("host verification unavailable: {}", e);
                }
            }
        }
    }
}

/// Advance the 64-bit nonce cursor: `nonce_lo` sweeps a 32-bit space and
/// `nonce_hi` bumps when it wraps.
fn advance_nonce(hi: u32, offset: u32, count: u32) -> (u32, u32) {
    let (next, wrapped) = offset.overflowing_add(count);
    if wrapped {
        (hi.wrapping_add(1), next)
    } else {
        (hi, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{AlgoSpec, Algorithm, Midstate, Target, TargetFormat};
    use crate::engine::{DeviceInfo, ResultSlot};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A scripted device: reports the given nonce offsets as hits on the
    /// chosen dispatch rounds.
    struct ScriptedDevice {
        configured: Arc<AtomicU32>,
        hits: Vec<Vec<u32>>,
        round: usize,
    }

    impl SearchDevice for ScriptedDevice {
        fn configure(
            &mut self,
            _spec: &AlgoSpec,
            _midstate: &Midstate,
            _target: &Target,
        ) -> Result<(), DeviceError> {
            self.configured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dispatch(
            &mut self,
            _nonce_hi: u32,
            nonce_offset: u32,
            _workgroups: u32,
        ) -> Result<Vec<ResultSlot>, DeviceError> {
            let hits = self.hits.get(self.round).cloned().unwrap_or_default();
            self.round += 1;
            Ok(hits
                .into_iter()
                .map(|delta| ResultSlot {
                    nonce_lo: nonce_offset.wrapping_add(delta),
                    hash_w0: 0,
                    hash_w1: 0,
                })
                .collect())
        }

        fn info(&self) -> DeviceInfo {
            DeviceInfo { name: "scripted".into(), compute_units: 1, max_workgroup_size: 256 }
        }
    }

    fn easy_work() -> Work {
        Work {
            location_txid: [7; 32],
            contract_ref: [8; 36],
            input_script: vec![0x51],
            output_script: vec![0x6a],
            target: Target::from_difficulty(TargetFormat::Full256, 1),
            algorithm: Algorithm::Blake3,
        }
    }

    #[test]
    fn test_advance_nonce_wraps_into_hi() {
        assert_eq!(advance_nonce(0, 0, 256), (0, 256));
        assert_eq!(advance_nonce(0, u32::MAX - 100, 256), (1, 155));
        assert_eq!(advance_nonce(5, u32::MAX, 1), (6, 0));
    }

    #[tokio::test]
    async fn test_driver_emits_sorted_verified_candidates() {
        let configured = Arc::new(AtomicU32::new(0));
        let device = ScriptedDevice {
            configured: configured.clone(),
            // Out of order on purpose; one round of hits then silence.
            hits: vec![vec![30, 2, 17]],
            round: 0,
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handle = EngineHandle::new();
        let driver = SearchDriver::new(Box::new(device), handle.clone(), tx, Some(1));

        handle.start(easy_work());
        let runner = tokio::spawn(driver.run());

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            received.iter().map(|c| c.nonce_lo).collect::<Vec<_>>(),
            vec![2, 17, 30]
        );
        assert_eq!(configured.load(Ordering::SeqCst), 1);

        // Closing the channel ends the loop.
        drop(rx);
        handle.request_stop();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_acknowledges_with_ready_and_resets_rate() {
        let device = ScriptedDevice {
            configured: Arc::new(AtomicU32::new(0)),
            hits: vec![],
            round: 0,
        };
        let (tx, rx) = mpsc::channel(4);
        let handle = EngineHandle::new();
        let driver = SearchDriver::new(Box::new(device), handle.clone(), tx, Some(1));

        handle.start(easy_work());
        let runner = tokio::spawn(driver.run());

        // Let it mine briefly, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.request_stop();

        let mut acknowledged = false;
        for _ in 0..50 {
            if handle.status() == EngineStatus::Ready {
                acknowledged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(acknowledged, "stop must resolve to ready within a dispatch interval");
        assert_eq!(handle.hash_rate(), 0.0);

        drop(rx);
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_change_reconfigures_without_teardown() {
        let configured = Arc::new(AtomicU32::new(0));
        let device = ScriptedDevice {
            configured: configured.clone(),
            hits: vec![],
            round: 0,
        };
        let (tx, rx) = mpsc::channel(4);
        let handle = EngineHandle::new();
        let driver = SearchDriver::new(Box::new(device), handle.clone(), tx, Some(1));

        handle.start(easy_work());
        let runner = tokio::spawn(driver.run());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut next = easy_work();
        next.location_txid = [9; 32];
        handle.request_change(next);

        let mut reconfigured = false;
        for _ in 0..50 {
            if configured.load(Ordering::SeqCst) == 2 {
                reconfigured = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconfigured, "change must re-upload midstate and target");
        assert_eq!(handle.status(), EngineStatus::Mining);

        drop(rx);
        handle.request_stop();
        runner.await.unwrap().unwrap();
    }
}
