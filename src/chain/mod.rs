/// Capability surfaces the core consumes from the outside world: the
/// chain gateway, the wallet and the optional contract discovery index.
/// Each is a small request/response contract so tests can script them.

pub mod electrumx;
pub mod protocol;

pub use protocol::{ChainError, ChainMethod, ChainResult};

use secp256k1::SecretKey;

use crate::contract::{ContractRef, OutPoint};
use crate::metadata::TokenMetadata;

/// One spendable wallet output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub txid: [u8; 32],
    pub vout: u32,
    pub value: u64,
}

/// The wallet's unspent set at one point in time.
#[derive(Debug, Clone, Default)]
pub struct WalletSnapshot {
    pub utxos: Vec<Utxo>,
}

impl WalletSnapshot {
    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }
}

/// Where a reference was minted and where its state sits now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefLocation {
    pub first: OutPoint,
    pub current: OutPoint,
}

/// Server-pushed events, delivered in emission order per script hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A subscribed script hash changed; the token deduplicates repeats.
    Status { script_hash: String, status: Option<String> },
    /// The transport dropped; the coordinator decides how hard to recover.
    Disconnected,
}

/// Read/broadcast access to the chain.
pub trait ChainGateway: Send + Sync {
    /// Fetch a raw transaction. `fresh` bypasses any cache.
    fn fetch_tx(
        &self,
        txid: &[u8; 32],
        fresh: bool,
    ) -> impl std::future::Future<Output = ChainResult<Vec<u8>>> + Send;

    /// Resolve a reference to its first and current locations.
    fn fetch_ref(
        &self,
        contract_ref: &ContractRef,
    ) -> impl std::future::Future<Output = ChainResult<RefLocation>> + Send;

    /// Subscribe to script-hash status events.
    fn subscribe(
        &self,
        script_hash: &str,
    ) -> impl std::future::Future<Output = ChainResult<()>> + Send;

    fn unsubscribe(
        &self,
        script_hash: &str,
    ) -> impl std::future::Future<Output = ChainResult<()>> + Send;

    /// Broadcast a raw transaction, returning its txid in wire order.
    /// Server refusals surface as [`ChainError::Rejected`].
    fn broadcast(
        &self,
        raw_tx: &[u8],
    ) -> impl std::future::Future<Output = ChainResult<[u8; 32]>> + Send;
}

impl<T: ChainGateway + Sync> ChainGateway for std::sync::Arc<T> {
    async fn fetch_tx(&self, txid: &[u8; 32], fresh: bool) -> ChainResult<Vec<u8>> {
        (**self).fetch_tx(txid, fresh).await
    }

    async fn fetch_ref(&self, contract_ref: &ContractRef) -> ChainResult<RefLocation> {
        (**self).fetch_ref(contract_ref).await
    }

    async fn subscribe(&self, script_hash: &str) -> ChainResult<()> {
        (**self).subscribe(script_hash).await
    }

    async fn unsubscribe(&self, script_hash: &str) -> ChainResult<()> {
        (**self).unsubscribe(script_hash).await
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> ChainResult<[u8; 32]> {
        (**self).broadcast(raw_tx).await
    }
}

/// Key material and funding supplied by the wallet.
pub trait Wallet: Send + Sync {
    /// Human-readable destination label for logs.
    fn address(&self) -> String;

    /// Hash160 of the mining public key.
    fn pubkey_hash(&self) -> [u8; 20];

    /// Locking script change returns to.
    fn change_script(&self) -> Vec<u8>;

    fn signing_key(&self) -> SecretKey;

    /// Fetch the current unspent set.
    fn unspent(&self) -> impl std::future::Future<Output = ChainResult<WalletSnapshot>> + Send;
}

/// Optional contract discovery. Failures are non-fatal; callers fall
/// back to statically configured references.
pub trait Discovery: Send + Sync {
    fn list_contracts(
        &self,
    ) -> impl std::future::Future<Output = ChainResult<Vec<(ContractRef, u32)>>> + Send;

    fn extended_info(
        &self,
        contract_ref: &ContractRef,
    ) -> impl std::future::Future<Output = ChainResult<TokenMetadata>> + Send;
}
