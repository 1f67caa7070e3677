//! The claim coordinator.
//!
//! One task owns the contract state, the wallet snapshot and the engine
//! handle. Candidates arrive from the search driver, chain events from
//! the gateway; everything else (broadcast, recovery, watchdogs) happens
//! serially in here. At most one claim is ever in flight, and when
//! several candidates pile up behind a broadcast only the freshest is
//! tried next.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;
use colored::Colorize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::algo::{verify, Target};
use crate::chain::{ChainError, ChainEvent, ChainGateway, Wallet, WalletSnapshot};
use crate::claim::{self, ClaimError, ClaimRequest};
use crate::contract::script::{self, ScriptError};
use crate::contract::{ContractState, OutPoint, StateHeader};
use crate::daa::{DaaParams, DaaState};
use crate::engine::{EngineHandle, NonceCandidate, Work};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("wallet balance too low: {balance} photons")]
    BalanceTooLow { balance: u64 },
}

/// How a broadcast refusal is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastErrorKind {
    MempoolConflict,
    ContractFail,
    MissingInputs,
    LowFee,
    Other,
}

/// Map the server's reason string onto the recovery policy.
pub fn classify_broadcast_error(reason: &str) -> BroadcastErrorKind {
    if reason.contains("txn-mempool-conflict") {
        BroadcastErrorKind::MempoolConflict
    } else if reason.contains("mandatory-script-verify-flag-failed") {
        BroadcastErrorKind::ContractFail
    } else if reason.contains("missing inputs") {
        BroadcastErrorKind::MissingInputs
    } else if reason.contains("min relay fee not met") || reason.contains("bad-txns-in-belowout") {
        BroadcastErrorKind::LowFee
    } else {
        BroadcastErrorKind::Other
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Photons the wallet must hold before and while mining.
    pub min_balance: u64,
    /// Window after a broadcast in which a status event must arrive.
    pub subscription_check: Duration,
    /// Silence window after which the location is re-fetched.
    pub contract_check: Duration,
    /// Shortened window armed after a mempool conflict.
    pub conflict_check: Duration,
    /// Consecutive conflicts that trigger full recovery.
    pub max_conflicts: u32,
    /// Recent own-mint locations remembered for echo suppression.
    pub recent_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            min_balance: 1_000_000,
            subscription_check: Duration::from_secs(10),
            contract_check: Duration::from_secs(60),
            conflict_check: Duration::from_secs(10),
            max_conflicts: 3,
            recent_capacity: 20,
        }
    }
}

/// Mint counters shared with the stats display.
#[derive(Debug, Default)]
pub struct MintCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
}

impl MintCounters {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

pub struct Coordinator<G, W> {
    gateway: G,
    wallet: W,
    config: CoordinatorConfig,
    params: DaaParams,
    state: ContractState,
    daa: DaaState,
    engine: EngineHandle,
    snapshot: WalletSnapshot,
    mint_message: String,
    mining_enabled: bool,
    conflict_count: u32,
    conflict_pending: bool,
    recent_locations: VecDeque<[u8; 32]>,
    last_status: Option<String>,
    subscribed_hash: Option<String>,
    subscription_deadline: Option<Instant>,
    contract_deadline: Option<Instant>,
    counters: Arc<MintCounters>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<G: ChainGateway, W: Wallet> Coordinator<G, W> {
    pub fn new(
        gateway: G,
        wallet: W,
        config: CoordinatorConfig,
        params: DaaParams,
        state: ContractState,
        engine: EngineHandle,
        mint_message: String,
    ) -> Self {
        let daa = DaaState::new(
            state.header.target.difficulty(),
            state.header.height,
            state.header.last_time.map(u64::from).unwrap_or(0),
        );
        Coordinator {
            gateway,
            wallet,
            config,
            params,
            state,
            daa,
            engine,
            snapshot: WalletSnapshot::default(),
            mint_message,
            mining_enabled: false,
            conflict_count: 0,
            conflict_pending: false,
            recent_locations: VecDeque::new(),
            last_status: None,
            subscribed_hash: None,
            subscription_deadline: None,
            contract_deadline: None,
            counters: Arc::new(MintCounters::default()),
            clock: Box::new(unix_now),
        }
    }

    /// Replace the wall clock, for deterministic tests.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn counters(&self) -> Arc<MintCounters> {
        self.counters.clone()
    }

    pub fn state(&self) -> &ContractState {
        &self.state
    }

    pub fn is_mining(&self) -> bool {
        self.mining_enabled
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// The engine work for the current contract state.
    pub fn current_work(&self) -> Work {
        Work {
            location_txid: self.state.location.txid,
            contract_ref: self.state.header.contract_ref,
            input_script: self.wallet.change_script(),
            output_script: script::build_message_script(&self.mint_message),
            target: self.state.header.target,
            algorithm: self.state.header.algorithm,
        }
    }

    /// Gate, subscribe and start the engine.
    pub async fn start(&mut self) -> Result<(), CoordinatorError> {
        self.snapshot = self.wallet.unspent().await?;
        let balance = self.snapshot.balance();
        if balance < self.config.min_balance {
            return Err(CoordinatorError::BalanceTooLow { balance });
        }

        if self.state.is_burned() {
            tracing::warn!("contract is already minted out");
            return Ok(());
        }

        self.resubscribe().await?;
        self.mining_enabled = true;
        self.contract_deadline = Some(Instant::now() + self.config.contract_check);
        self.engine.start(self.current_work());
        tracing::info!(
            contract = %self.state.location,
            height = self.state.header.height,
            max_height = self.state.header.max_height,
            algorithm = %self.state.header.algorithm,
            "mining started"
        );
        Ok(())
    }

    /// Serial event loop. Candidates that queued up behind a broadcast
    /// collapse to the freshest one.
    pub async fn run(
        mut self,
        mut candidates: mpsc::Receiver<NonceCandidate>,
        mut events: mpsc::Receiver<ChainEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<(), CoordinatorError> {
        const FAR: Duration = Duration::from_secs(3600);
        loop {
            if shutdown.load(Ordering::SeqCst) {
                self.engine.request_stop();
                tracing::info!("coordinator shutting down");
                return Ok(());
            }

            let sub_at = self.subscription_deadline.unwrap_or_else(|| Instant::now() + FAR);
            let con_at = self.contract_deadline.unwrap_or_else(|| Instant::now() + FAR);

            tokio::select! {
                maybe = candidates.recv() => {
                    let Some(mut candidate) = maybe else { return Ok(()) };
                    while let Ok(newer) = candidates.try_recv() {
                        candidate = newer;
                    }
                    self.handle_candidate(candidate).await?;
                }
                maybe = events.recv() => {
                    let Some(event) = maybe else { return Ok(()) };
                    self.handle_event(event).await?;
                }
                _ = tokio::time::sleep_until(sub_at), if self.subscription_deadline.is_some() => {
                    self.subscription_deadline = None;
                    self.handle_subscription_timeout().await?;
                }
                _ = tokio::time::sleep_until(con_at), if self.contract_deadline.is_some() => {
                    self.contract_deadline = None;
                    self.handle_contract_timeout().await?;
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// One verified nonce: assemble, broadcast and advance optimistically.
    pub async fn handle_candidate(
        &mut self,
        candidate: NonceCandidate,
    ) -> Result<(), CoordinatorError> {
        if !self.mining_enabled || self.state.is_burned() {
            return Ok(());
        }

        // The driver verified already; check again against the state this
        // claim spends, in case a change raced the candidate channel.
        let work = self.current_work();
        let verified = verify::verify(
            work.algorithm,
            &work.preimage(),
            candidate.nonce(),
            &work.target,
        )
        .unwrap_or(false);
        if !verified {
            tracing::debug!("stale candidate dropped");
            return Ok(());
        }

        let now = self.now();
        let next_height = self.state.header.height + 1;
        let terminal = next_height >= self.state.header.max_height;

        let next_header = if terminal {
            None
        } else {
            let next_difficulty = self.daa.next_difficulty(&self.params, next_height, now);
            Some(self.next_state_header(next_height, next_difficulty, now))
        };

        let contract_value = match self.contract_value().await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("could not fetch contract output, deferring claim: {}", e);
                return Ok(());
            }
        };

        let request = ClaimRequest {
            state: &self.state,
            next_header: next_header.clone(),
            nonce: candidate.nonce(),
            input_script: &work.input_script,
            output_script: &work.output_script,
            contract_value,
            snapshot: &self.snapshot,
            pubkey_hash: self.wallet.pubkey_hash(),
            change_script: self.wallet.change_script(),
        };
        let built = claim::build_claim(&request, &self.wallet.signing_key())?;

        match self.gateway.broadcast(&built.raw).await {
            Ok(txid) => {
                self.on_broadcast_accepted(txid, next_header, next_height, now, built.change)
                    .await?;
            }
            Err(ChainError::Rejected(reason)) => {
                self.on_broadcast_rejected(&reason).await?;
            }
            Err(e) => {
                tracing::warn!("broadcast transport failure: {}", e);
            }
        }
        Ok(())
    }

    async fn on_broadcast_accepted(
        &mut self,
        txid: [u8; 32],
        next_header: Option<StateHeader>,
        next_height: u64,
        now: u64,
        change: u64,
    ) -> Result<(), CoordinatorError> {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.conflict_count = 0;
        self.conflict_pending = false;

        self.recent_locations.push_back(txid);
        while self.recent_locations.len() > self.config.recent_capacity {
            self.recent_locations.pop_front();
        }

        self.daa.advance(&self.params, next_height, now);

        println!(
            "[{}] {} height {}/{} txid {}",
            Local::now().format("%H:%M:%S"),
            "mint accepted".green().bold(),
            next_height,
            self.state.header.max_height,
            hex::encode({
                let mut d = txid;
                d.reverse();
                d
            })
        );

        match next_header {
            Some(header) => {
                self.state.header = header;
                self.state.location = OutPoint::new(txid, 0);
                self.resubscribe().await?;
                self.engine.request_change(self.current_work());
            }
            None => {
                self.state.header.height = self.state.header.max_height;
                self.stop_mining("minted out");
            }
        }

        // The claim spent the whole snapshot; only our change remains
        // until the next refresh.
        self.snapshot = WalletSnapshot {
            utxos: vec![crate::chain::Utxo { txid, vout: 3, value: change }],
        };
        if self.mining_enabled && self.snapshot.balance() < self.config.min_balance {
            self.stop_mining("wallet balance below minimum");
        }

        self.subscription_deadline = Some(Instant::now() + self.config.subscription_check);
        Ok(())
    }

    async fn on_broadcast_rejected(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        println!(
            "[{}] {} {}",
            Local::now().format("%H:%M:%S"),
            "mint rejected".red().bold(),
            reason
        );
        match classify_broadcast_error(reason) {
            BroadcastErrorKind::MempoolConflict => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.conflict_count += 1;
                if self.conflict_count >= self.config.max_conflicts {
                    tracing::warn!(
                        "{} consecutive mempool conflicts, running full recovery",
                        self.conflict_count
                    );
                    self.full_recovery().await?;
                } else {
                    self.conflict_pending = true;
                    self.contract_deadline = Some(Instant::now() + self.config.conflict_check);
                }
            }
            BroadcastErrorKind::ContractFail | BroadcastErrorKind::MissingInputs => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.full_recovery().await?;
            }
            BroadcastErrorKind::LowFee => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.stop_mining("broadcast refused for fees; check wallet funding");
            }
            BroadcastErrorKind::Other => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("mint rejected: {}", reason);
            }
        }
        Ok(())
    }

    /// A chain event: either a status for our subscription or a dropped
    /// transport.
    pub async fn handle_event(&mut self, event: ChainEvent) -> Result<(), CoordinatorError> {
        match event {
            ChainEvent::Status { script_hash, status } => {
                if Some(&script_hash) != self.subscribed_hash.as_ref() {
                    tracing::debug!("status for stale subscription ignored");
                    return Ok(());
                }
                if status.is_some() && status == self.last_status {
                    tracing::debug!("duplicate status ignored");
                    return Ok(());
                }
                self.last_status = status;
                self.subscription_deadline = None;
                self.contract_deadline = Some(Instant::now() + self.config.contract_check);
                self.refresh_location(false).await?;
            }
            ChainEvent::Disconnected => {
                tracing::warn!("chain link lost, running full recovery");
                self.full_recovery().await?;
            }
        }
        Ok(())
    }

    /// No status arrived within the post-broadcast window.
    pub async fn handle_subscription_timeout(&mut self) -> Result<(), CoordinatorError> {
        tracing::debug!("subscription check fired, refreshing unspent");
        match self.wallet.unspent().await {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => tracing::warn!("unspent refresh failed: {}", e),
        }
        Ok(())
    }

    /// The contract went silent, or a conflict recovery timer fired.
    pub async fn handle_contract_timeout(&mut self) -> Result<(), CoordinatorError> {
        if self.conflict_pending {
            self.conflict_pending = false;
            tracing::debug!("conflict recovery timer fired");
            self.full_recovery().await?;
        } else {
            tracing::debug!("contract silent, re-fetching location");
            self.refresh_location(true).await?;
            self.contract_deadline = Some(Instant::now() + self.config.contract_check);
        }
        Ok(())
    }

    /// Re-resolve the reference and load any new state.
    async fn refresh_location(&mut self, fresh: bool) -> Result<(), CoordinatorError> {
        let location = match self.gateway.fetch_ref(&self.state.header.contract_ref).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("reference lookup failed: {}", e);
                return Ok(());
            }
        };

        if self.recent_locations.contains(&location.current.txid) {
            tracing::debug!("location is our own mint, nothing to do");
            return Ok(());
        }
        if location.current == self.state.location {
            return Ok(());
        }

        tracing::info!(location = %location.current, "contract moved");
        self.load_state_at(location.current, fresh).await
    }

    /// Fetch the transaction at a location and adopt its contract state.
    async fn load_state_at(
        &mut self,
        location: OutPoint,
        fresh: bool,
    ) -> Result<(), CoordinatorError> {
        let raw = match self.gateway.fetch_tx(&location.txid, fresh).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("transaction fetch failed: {}", e);
                return Ok(());
            }
        };
        let outputs = claim::parse_tx_outputs(&raw)?;
        let (state, burn, message) =
            script::scan_outputs(&outputs, &self.state.header.contract_ref)?;

        match (state, burn) {
            (Some((vout, header)), _) => {
                let now = self.now();
                self.daa.advance(&self.params, header.height, now);
                self.state.header = header;
                self.state.location = OutPoint::new(location.txid, vout);
                self.state.message = message;
                self.resubscribe().await?;
                if self.mining_enabled {
                    self.engine.request_change(self.current_work());
                }
                tracing::info!(
                    height = self.state.header.height,
                    "contract state reloaded"
                );
            }
            (None, Some(_)) => {
                self.state.header.height = self.state.header.max_height;
                self.stop_mining("minted out");
            }
            (None, None) => {
                tracing::warn!("location does not carry the contract, ignoring");
            }
        }
        Ok(())
    }

    /// Stop, refresh unspent, refetch location, resubscribe, restart.
    pub async fn full_recovery(&mut self) -> Result<(), CoordinatorError> {
        tracing::info!("full recovery started");
        let was_mining = self.mining_enabled;
        self.engine.request_stop();
        self.conflict_count = 0;
        self.conflict_pending = false;

        match self.wallet.unspent().await {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => tracing::warn!("unspent refresh failed during recovery: {}", e),
        }

        if let Ok(location) = self.gateway.fetch_ref(&self.state.header.contract_ref).await {
            if location.current != self.state.location
                && !self.recent_locations.contains(&location.current.txid)
            {
                self.load_state_at(location.current, true).await?;
            }
        }

        // Drop the old subscription unconditionally; the link itself may
        // have been replaced under us.
        self.subscribed_hash = None;
        self.resubscribe().await?;

        if was_mining && self.mining_enabled && !self.state.is_burned() {
            self.engine.start(self.current_work());
            tracing::info!("engine restarted after recovery");
        }
        self.contract_deadline = Some(Instant::now() + self.config.contract_check);
        Ok(())
    }

    /// Subscribe to the current state script, dropping any previous one.
    async fn resubscribe(&mut self) -> Result<(), CoordinatorError> {
        let hash = script::script_hash(&script::build_state_script(&self.state.header));
        if self.subscribed_hash.as_ref() == Some(&hash) {
            return Ok(());
        }
        if let Some(old) = self.subscribed_hash.take() {
            if let Err(e) = self.gateway.unsubscribe(&old).await {
                tracing::debug!("unsubscribe failed: {}", e);
            }
        }
        self.last_status = None;
        self.gateway.subscribe(&hash).await?;
        self.subscribed_hash = Some(hash);
        Ok(())
    }

    fn stop_mining(&mut self, reason: &str) {
        self.mining_enabled = false;
        self.engine.request_stop();
        println!(
            "[{}] {} {}",
            Local::now().format("%H:%M:%S"),
            "mining stopped:".yellow().bold(),
            reason
        );
    }

    fn next_state_header(&self, next_height: u64, next_difficulty: u128, now: u64) -> StateHeader {
        let header = &self.state.header;
        let mut next = header.clone();
        next.height = next_height;
        next.target = Target::from_difficulty(header.target.format(), next_difficulty);
        if header.last_time.is_some() {
            next.last_time = Some(now as u32);
        }
        next
    }

    async fn contract_value(&self) -> Result<u64, CoordinatorError> {
        let raw = self.gateway.fetch_tx(&self.state.location.txid, false).await?;
        Ok(claim::output_value(&raw, self.state.location.vout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_broadcast_errors() {
        assert_eq!(
            classify_broadcast_error("258: txn-mempool-conflict"),
            BroadcastErrorKind::MempoolConflict
        );
        assert_eq!(
            classify_broadcast_error("mandatory-script-verify-flag-failed (Script failed)"),
            BroadcastErrorKind::ContractFail
        );
        assert_eq!(
            classify_broadcast_error("missing inputs"),
            BroadcastErrorKind::MissingInputs
        );
        assert_eq!(
            classify_broadcast_error("min relay fee not met"),
            BroadcastErrorKind::LowFee
        );
        assert_eq!(
            classify_broadcast_error("bad-txns-in-belowout"),
            BroadcastErrorKind::LowFee
        );
        assert_eq!(
            classify_broadcast_error("some novel refusal"),
            BroadcastErrorKind::Other
        );
    }

    #[test]
    fn test_config_defaults_match_policy() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.subscription_check, Duration::from_secs(10));
        assert_eq!(config.contract_check, Duration::from_secs(60));
        assert_eq!(config.conflict_check, Duration::from_secs(10));
        assert_eq!(config.max_conflicts, 3);
        assert_eq!(config.recent_capacity, 20);
    }
}
