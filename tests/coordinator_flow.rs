//! Coordinator scenarios driven through scripted chain and wallet
//! adapters: claim assembly, conflict recovery and the terminal mint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use secp256k1::SecretKey;

use dmint_miner::algo::preimage::sha256d;
use dmint_miner::algo::{Algorithm, Target, TargetFormat};
use dmint_miner::chain::{
    ChainError, ChainGateway, ChainResult, RefLocation, Utxo, Wallet, WalletSnapshot,
};
use dmint_miner::claim::parse_tx_outputs;
use dmint_miner::contract::script::build_p2pkh_script;
use dmint_miner::contract::{ContractRef, ContractState, OutPoint, StateHeader, REF_LEN};
use dmint_miner::coordinator::{Coordinator, CoordinatorConfig};
use dmint_miner::daa::DaaParams;
use dmint_miner::engine::{EngineHandle, EngineStatus, NonceCandidate};

#[derive(Clone)]
struct MockGateway {
    calls: Arc<Mutex<Vec<String>>>,
    broadcasts: Arc<Mutex<Vec<Vec<u8>>>>,
    broadcast_script: Arc<Mutex<VecDeque<Result<(), String>>>>,
    txs: Arc<Mutex<HashMap<[u8; 32], Vec<u8>>>>,
    current_location: Arc<Mutex<OutPoint>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        MockGateway {
            calls: Arc::default(),
            broadcasts: Arc::default(),
            broadcast_script: Arc::default(),
            txs: Arc::default(),
            current_location: Arc::new(Mutex::new(OutPoint::new([0; 32], 0))),
        }
    }
}

impl MockGateway {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn push_broadcast_result(&self, result: Result<(), String>) {
        self.broadcast_script.lock().unwrap().push_back(result);
    }

    fn insert_tx(&self, txid: [u8; 32], raw: Vec<u8>) {
        self.txs.lock().unwrap().insert(txid, raw);
    }
}

impl ChainGateway for MockGateway {
    async fn fetch_tx(&self, txid: &[u8; 32], _fresh: bool) -> ChainResult<Vec<u8>> {
        self.calls.lock().unwrap().push("fetch_tx".to_string());
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| ChainError::Protocol("unknown tx".to_string()))
    }

    async fn fetch_ref(&self, _contract_ref: &ContractRef) -> ChainResult<RefLocation> {
        self.calls.lock().unwrap().push("fetch_ref".to_string());
        let current = *self.current_location.lock().unwrap();
        Ok(RefLocation { first: current, current })
    }

    async fn subscribe(&self, script_hash: &str) -> ChainResult<()> {
        self.calls.lock().unwrap().push(format!("subscribe:{}", script_hash));
        Ok(())
    }

    async fn unsubscribe(&self, script_hash: &str) -> ChainResult<()> {
        self.calls.lock().unwrap().push(format!("unsubscribe:{}", script_hash));
        Ok(())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> ChainResult<[u8; 32]> {
        self.calls.lock().unwrap().push("broadcast".to_string());
        self.broadcasts.lock().unwrap().push(raw_tx.to_vec());
        match self.broadcast_script.lock().unwrap().pop_front() {
            Some(Err(reason)) => Err(ChainError::Rejected(reason)),
            _ => Ok(sha256d(raw_tx)),
        }
    }
}

#[derive(Clone)]
struct MockWallet {
    secret: SecretKey,
    pubkey_hash: [u8; 20],
    snapshot: Arc<Mutex<WalletSnapshot>>,
    unspent_calls: Arc<AtomicU32>,
}

impl MockWallet {
    fn funded() -> Self {
        MockWallet {
            secret: SecretKey::from_slice(&[0x42; 32]).unwrap(),
            pubkey_hash: [0x07; 20],
            snapshot: Arc::new(Mutex::new(WalletSnapshot {
                utxos: vec![Utxo { txid: [0xee; 32], vout: 0, value: 50_000_000 }],
            })),
            unspent_calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Wallet for MockWallet {
    fn address(&self) -> String {
        "pkh:test".to_string()
    }

    fn pubkey_hash(&self) -> [u8; 20] {
        self.pubkey_hash
    }

    fn change_script(&self) -> Vec<u8> {
        build_p2pkh_script(&self.pubkey_hash)
    }

    fn signing_key(&self) -> SecretKey {
        self.secret
    }

    async fn unspent(&self) -> ChainResult<WalletSnapshot> {
        self.unspent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

/// A transaction with no inputs and one output, enough for value lookups.
fn single_output_tx(value: u64, script: &[u8]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&2u32.to_le_bytes());
    raw.push(0x00); // no inputs
    raw.push(0x01);
    raw.extend_from_slice(&value.to_le_bytes());
    raw.push(script.len() as u8);
    raw.extend_from_slice(script);
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw
}

fn contract_state(height: u64, max_height: u64) -> ContractState {
    let header = StateHeader {
        height,
        contract_ref: [0xc1; REF_LEN],
        token_ref: [0xc2; REF_LEN],
        max_height,
        reward: 5_000,
        // Unit difficulty so any nonce verifies.
        target: Target::from_difficulty(TargetFormat::Full256, 1),
        algorithm: Algorithm::Blake3,
        last_time: Some(1_700_000_000),
        target_time: Some(300),
    };
    ContractState::new(header, OutPoint::new([0x99; 32], 0))
}

fn candidate(nonce_lo: u32) -> NonceCandidate {
    NonceCandidate { nonce_hi: 0, nonce_lo, hash: [0; 32] }
}

struct Rig {
    coordinator: Coordinator<MockGateway, MockWallet>,
    gateway: MockGateway,
    wallet: MockWallet,
    engine: EngineHandle,
}

async fn started_rig(state: ContractState) -> Rig {
    let gateway = MockGateway::default();
    *gateway.current_location.lock().unwrap() = state.location;
    gateway.insert_tx(
        state.location.txid,
        single_output_tx(
            546,
            &dmint_miner::contract::script::build_state_script(&state.header),
        ),
    );

    let wallet = MockWallet::funded();
    let engine = EngineHandle::new();
    let mut coordinator = Coordinator::new(
        gateway.clone(),
        wallet.clone(),
        CoordinatorConfig::default(),
        DaaParams::default(),
        state,
        engine.clone(),
        "test mint".to_string(),
    )
    .with_clock(|| 1_700_000_600);

    coordinator.start().await.expect("start succeeds");
    Rig { coordinator, gateway, wallet, engine }
}

#[tokio::test]
async fn happy_path_builds_four_output_claim_and_advances() {
    let mut rig = started_rig(contract_state(10, 1_000)).await;

    rig.coordinator.handle_candidate(candidate(7)).await.unwrap();

    // Exactly one broadcast with the canonical output shape.
    assert_eq!(rig.gateway.call_count("broadcast"), 1);
    let raw = rig.gateway.broadcasts.lock().unwrap()[0].clone();
    let outputs = parse_tx_outputs(&raw).unwrap();
    assert_eq!(outputs.len(), 4);
    assert_eq!(outputs[1].0, 5_000); // reward

    // Optimistic advance: new height, location at output zero of our tx.
    let expected_txid = sha256d(&raw);
    assert_eq!(rig.coordinator.state().header.height, 11);
    assert_eq!(rig.coordinator.state().location, OutPoint::new(expected_txid, 0));
    assert_eq!(rig.coordinator.counters().accepted(), 1);
    assert!(rig.coordinator.is_mining());

    // The engine was handed the new location without a restart.
    let work = rig.engine.take_work().expect("work installed");
    assert_eq!(work.location_txid, expected_txid);
}

#[tokio::test]
async fn own_mint_echo_is_suppressed() {
    let mut rig = started_rig(contract_state(10, 1_000)).await;

    rig.coordinator.handle_candidate(candidate(1)).await.unwrap();
    let raw = rig.gateway.broadcasts.lock().unwrap()[0].clone();
    let our_txid = sha256d(&raw);

    // The subscription echoes our own mint back as the new location.
    *rig.gateway.current_location.lock().unwrap() = OutPoint::new(our_txid, 0);
    let fetches_before = rig.gateway.call_count("fetch_tx");
    rig.coordinator
        .handle_event(dmint_miner::chain::ChainEvent::Status {
            script_hash: latest_subscribed(&rig.gateway),
            status: Some("status-1".to_string()),
        })
        .await
        .unwrap();

    // Recognized as ours: no state reload happened.
    assert_eq!(rig.gateway.call_count("fetch_tx"), fetches_before);
    assert_eq!(rig.coordinator.state().header.height, 11);
}

fn latest_subscribed(gateway: &MockGateway) -> String {
    gateway
        .calls()
        .iter()
        .rev()
        .find_map(|c| c.strip_prefix("subscribe:").map(|s| s.to_string()))
        .expect("subscribed at least once")
}

#[tokio::test]
async fn mempool_conflicts_escalate_to_full_recovery_on_third() {
    let mut rig = started_rig(contract_state(10, 1_000)).await;
    for _ in 0..3 {
        rig.gateway
            .push_broadcast_result(Err("258: txn-mempool-conflict".to_string()));
    }

    // First conflict: reject recorded, engine left running.
    rig.coordinator.handle_candidate(candidate(1)).await.unwrap();
    assert_eq!(rig.coordinator.counters().rejected(), 1);
    assert!(rig.coordinator.is_mining());
    let unspent_after_first = rig.wallet.unspent_calls.load(Ordering::SeqCst);

    // Second conflict: still no recovery.
    rig.coordinator.handle_candidate(candidate(2)).await.unwrap();
    assert_eq!(rig.coordinator.counters().rejected(), 2);
    assert_eq!(rig.wallet.unspent_calls.load(Ordering::SeqCst), unspent_after_first);

    // Third consecutive conflict: full recovery refreshes the wallet,
    // re-resolves the reference, resubscribes and restarts the engine.
    rig.coordinator.handle_candidate(candidate(3)).await.unwrap();
    assert_eq!(rig.coordinator.counters().rejected(), 3);
    assert!(rig.wallet.unspent_calls.load(Ordering::SeqCst) > unspent_after_first);
    assert!(rig.gateway.call_count("fetch_ref") >= 1);
    assert!(rig.gateway.call_count("subscribe") >= 2);
    assert_eq!(rig.engine.status(), EngineStatus::Change);
    assert!(rig.coordinator.is_mining());
}

#[tokio::test]
async fn contract_failure_recovers_immediately() {
    let mut rig = started_rig(contract_state(10, 1_000)).await;
    rig.gateway.push_broadcast_result(Err(
        "mandatory-script-verify-flag-failed (Script evaluated to false)".to_string(),
    ));

    let unspent_before = rig.wallet.unspent_calls.load(Ordering::SeqCst);
    rig.coordinator.handle_candidate(candidate(1)).await.unwrap();

    assert!(rig.wallet.unspent_calls.load(Ordering::SeqCst) > unspent_before);
    assert_eq!(rig.engine.status(), EngineStatus::Change);
}

#[tokio::test]
async fn low_fee_stops_mining() {
    let mut rig = started_rig(contract_state(10, 1_000)).await;
    rig.gateway.push_broadcast_result(Err("min relay fee not met".to_string()));

    rig.coordinator.handle_candidate(candidate(1)).await.unwrap();

    assert!(!rig.coordinator.is_mining());
    assert_eq!(rig.engine.status(), EngineStatus::Stop);

    // Later candidates are ignored while stopped.
    let broadcasts = rig.gateway.call_count("broadcast");
    rig.coordinator.handle_candidate(candidate(2)).await.unwrap();
    assert_eq!(rig.gateway.call_count("broadcast"), broadcasts);
}

#[tokio::test]
async fn terminal_mint_burns_and_stops() {
    let mut rig = started_rig(contract_state(999, 1_000)).await;

    rig.coordinator.handle_candidate(candidate(9)).await.unwrap();

    // The claim carries the burn marker instead of a next state.
    let raw = rig.gateway.broadcasts.lock().unwrap()[0].clone();
    let outputs = parse_tx_outputs(&raw).unwrap();
    let burn = dmint_miner::contract::script::build_burn_script(
        &rig.coordinator.state().header.contract_ref,
    );
    assert_eq!(outputs[0].1, burn);

    assert_eq!(
        rig.coordinator.state().header.height,
        rig.coordinator.state().header.max_height
    );
    assert!(rig.coordinator.state().is_burned());
    assert!(!rig.coordinator.is_mining());
    assert_eq!(rig.engine.status(), EngineStatus::Stop);
}

#[tokio::test]
async fn someone_elses_burn_suspends_mining() {
    let mut rig = started_rig(contract_state(998, 1_000)).await;

    // Another miner made the terminal mint: the reference now resolves
    // to a transaction carrying only the burn sibling.
    let burn_tx = single_output_tx(
        0,
        &dmint_miner::contract::script::build_burn_script(
            &rig.coordinator.state().header.contract_ref,
        ),
    );
    let burn_txid = sha256d(&burn_tx);
    rig.gateway.insert_tx(burn_txid, burn_tx);
    *rig.gateway.current_location.lock().unwrap() = OutPoint::new(burn_txid, 0);

    rig.coordinator
        .handle_event(dmint_miner::chain::ChainEvent::Status {
            script_hash: latest_subscribed(&rig.gateway),
            status: Some("status-burn".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(
        rig.coordinator.state().header.height,
        rig.coordinator.state().header.max_height
    );
    assert!(!rig.coordinator.is_mining());
}

#[tokio::test]
async fn balance_gate_refuses_to_start() {
    let state = contract_state(10, 1_000);
    let gateway = MockGateway::default();
    *gateway.current_location.lock().unwrap() = state.location;

    let wallet = MockWallet::funded();
    wallet.snapshot.lock().unwrap().utxos = vec![Utxo { txid: [1; 32], vout: 0, value: 5_000 }];

    let engine = EngineHandle::new();
    let mut coordinator = Coordinator::new(
        gateway,
        wallet,
        CoordinatorConfig::default(),
        DaaParams::default(),
        state,
        engine,
        String::new(),
    );
    assert!(coordinator.start().await.is_err());
    assert!(!coordinator.is_mining());
}
