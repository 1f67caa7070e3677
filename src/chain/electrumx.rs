//! ElectrumX-style chain gateway over newline-delimited JSON-RPC on TCP.
//!
//! One writer behind a mutex, one spawned reader task that routes
//! id-replies to their waiters and subscription notifications onto the
//! event channel, and a heartbeat task that pings the server and reports
//! a dead link. Raw transactions are cached by txid; `fresh` bypasses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secp256k1::{Secp256k1, SecretKey};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::protocol::{ChainError, ChainMethod, ChainResult, RpcRequest, RpcResponse};
use super::{ChainEvent, ChainGateway, RefLocation, Utxo, Wallet, WalletSnapshot};
use crate::contract::{script, ContractRef, OutPoint};

#[derive(Debug, Clone)]
pub struct ElectrumConfig {
    /// Servers tried in order, `host:port`.
    pub servers: Vec<String>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Pause between servers while rotating.
    pub server_backoff: Duration,
    /// Pause after every server failed once.
    pub rotation_backoff: Duration,
}

impl ElectrumConfig {
    pub fn new(servers: Vec<String>) -> Self {
        ElectrumConfig {
            servers,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            server_backoff: Duration::from_secs(10),
            rotation_backoff: Duration::from_secs(120),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct ElectrumClient {
    config: ElectrumConfig,
    writer: Arc<Mutex<Option<WriteHalf<TcpStream>>>>,
    pending: PendingMap,
    request_id: AtomicU64,
    events: mpsc::Sender<ChainEvent>,
    tx_cache: Arc<Mutex<HashMap<[u8; 32], Vec<u8>>>>,
}

impl ElectrumClient {
    pub fn new(config: ElectrumConfig, events: mpsc::Sender<ChainEvent>) -> Self {
        ElectrumClient {
            config,
            writer: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_id: AtomicU64::new(0),
            events,
            tx_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Connect to one server and start the reader and heartbeat tasks.
    pub async fn connect(&self, server: &str) -> ChainResult<()> {
        tracing::info!("connecting to chain server: {}", server);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| ChainError::Timeout("connect"))?
            .map_err(|e| ChainError::Connection(format!("failed to connect to {}: {}", server, e)))?;

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        self.start_reader(reader);
        self.start_heartbeat();

        tracing::info!("connected to chain server");
        Ok(())
    }

    /// Rotate through the configured servers until one accepts, with the
    /// per-server and per-rotation pauses.
    pub async fn connect_any(&self) -> ChainResult<()> {
        if self.config.servers.is_empty() {
            return Err(ChainError::Connection("no servers configured".to_string()));
        }
        loop {
            for server in &self.config.servers {
                match self.connect(server).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!("server {} unavailable: {}", server, e);
                        tokio::time::sleep(self.config.server_backoff).await;
                    }
                }
            }
            tracing::warn!(
                "all {} chain servers failed, backing off",
                self.config.servers.len()
            );
            tokio::time::sleep(self.config.rotation_backoff).await;
        }
    }

    fn start_reader(&self, reader: ReadHalf<TcpStream>) {
        let pending = self.pending.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::error!("connection closed by chain server");
                        break;
                    }
                    Ok(_) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::trace!("received: {}", line);

                        match serde_json::from_str::<RpcResponse>(line) {
                            Ok(response) => {
                                if let Some(id) = response.id {
                                    let waiter = pending.lock().await.remove(&id);
                                    if let Some(tx) = waiter {
                                        let _ = tx.send(response);
                                    } else {
                                        tracing::debug!("reply for unknown request id {}", id);
                                    }
                                } else if response.is_notification() {
                                    route_notification(&events, &response).await;
                                }
                            }
                            Err(e) => {
                                tracing::error!("failed to parse server line: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to read from chain server: {}", e);
                        break;
                    }
                }
            }

            // Wake every waiter with a dropped sender and tell the
            // coordinator the link died.
            pending.lock().await.clear();
            let _ = events.send(ChainEvent::Disconnected).await;
        });
    }

    fn start_heartbeat(&self) {
        let writer = self.writer.clone();
        let pending = self.pending.clone();
        let events = self.events.clone();
        let interval = self.config.heartbeat_interval;
        let reply_window = self.config.heartbeat_timeout;
        let id_counter = Arc::new(AtomicU64::new(u64::MAX / 2));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let id = id_counter.fetch_add(1, Ordering::Relaxed);
                let request = RpcRequest::new(id, ChainMethod::Ping, vec![]);
                let Ok(json_line) = request.to_json_line() else { continue };

                let (tx, rx) = oneshot::channel();
                pending.lock().await.insert(id, tx);

                let write_ok = {
                    let mut writer_lock = writer.lock().await;
                    match writer_lock.as_mut() {
                        Some(w) => {
                            w.write_all(json_line.as_bytes()).await.is_ok()
                                && w.flush().await.is_ok()
                        }
                        None => false,
                    }
                };

                let alive = write_ok
                    && matches!(tokio::time::timeout(reply_window, rx).await, Ok(Ok(_)));

                if !alive {
                    pending.lock().await.remove(&id);
                    tracing::warn!("heartbeat missed, declaring disconnection");
                    let _ = events.send(ChainEvent::Disconnected).await;
                    break;
                }
                tracing::trace!("heartbeat ok");
            }
        });
    }

    async fn send_request(&self, method: ChainMethod, params: Vec<Value>) -> ChainResult<RpcResponse> {
        let id = self.next_id();
        let request = RpcRequest::new(id, method, params);
        let json_line = request.to_json_line()?;

        tracing::debug!("sending: {}", json_line.trim());

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer_lock = self.writer.lock().await;
            let writer = writer_lock.as_mut().ok_or(ChainError::NotConnected)?;
            writer.write_all(json_line.as_bytes()).await?;
            writer.flush().await?;
        }

        let response = rx.await.map_err(|_| ChainError::NotConnected)?;
        Ok(response)
    }

    /// Unspent outputs for a script hash.
    pub async fn list_unspent(&self, script_hash: &str) -> ChainResult<Vec<Utxo>> {
        let response = self
            .send_request(
                ChainMethod::ScriptHashListUnspent,
                vec![Value::String(script_hash.to_string())],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Protocol(message));
        }

        let entries = response
            .result
            .as_ref()
            .and_then(|r| r.as_array())
            .ok_or_else(|| ChainError::Protocol("listunspent: result not an array".to_string()))?;

        let mut utxos = Vec::with_capacity(entries.len());
        for entry in entries {
            let txid_hex = entry
                .get("tx_hash")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ChainError::Protocol("listunspent: missing tx_hash".to_string()))?;
            let vout = entry
                .get("tx_pos")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ChainError::Protocol("listunspent: missing tx_pos".to_string()))?;
            let value = entry
                .get("value")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ChainError::Protocol("listunspent: missing value".to_string()))?;
            utxos.push(Utxo {
                txid: display_hex_to_txid(txid_hex)?,
                vout: vout as u32,
                value,
            });
        }
        Ok(utxos)
    }
}

async fn route_notification(events: &mpsc::Sender<ChainEvent>, response: &RpcResponse) {
    let Some(method) = response.method.as_deref() else { return };
    if method != ChainMethod::ScriptHashSubscribe.as_str() {
        tracing::debug!("ignoring notification: {}", method);
        return;
    }
    let Some(params) = response.params.as_ref() else { return };
    let Some(script_hash) = params.first().and_then(|v| v.as_str()) else {
        tracing::error!("malformed status notification");
        return;
    };
    let status = params.get(1).and_then(|v| v.as_str()).map(|s| s.to_string());
    let event = ChainEvent::Status { script_hash: script_hash.to_string(), status };
    if events.send(event).await.is_err() {
        tracing::debug!("event receiver dropped");
    }
}

/// Wire-order txid to the reversed hex the servers speak.
pub fn txid_to_display_hex(txid: &[u8; 32]) -> String {
    let mut display = *txid;
    display.reverse();
    hex::encode(display)
}

/// Reversed server hex back to wire order.
pub fn display_hex_to_txid(s: &str) -> ChainResult<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| ChainError::Protocol(format!("bad txid hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(ChainError::Protocol(format!("bad txid length: {}", bytes.len())));
    }
    let mut txid = [0u8; 32];
    for (i, b) in bytes.iter().enumerate() {
        txid[31 - i] = *b;
    }
    Ok(txid)
}

fn parse_outpoint(value: &Value) -> ChainResult<OutPoint> {
    let txid_hex = value
        .get("txid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChainError::Protocol("ref.get: missing txid".to_string()))?;
    let vout = value
        .get("vout")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ChainError::Protocol("ref.get: missing vout".to_string()))?;
    Ok(OutPoint::new(display_hex_to_txid(txid_hex)?, vout as u32))
}

impl ChainGateway for ElectrumClient {
    async fn fetch_tx(&self, txid: &[u8; 32], fresh: bool) -> ChainResult<Vec<u8>> {
        if !fresh {
            if let Some(raw) = self.tx_cache.lock().await.get(txid) {
                return Ok(raw.clone());
            }
        }

        let response = self
            .send_request(
                ChainMethod::TransactionGet,
                vec![Value::String(txid_to_display_hex(txid)), Value::Bool(false)],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Protocol(message));
        }

        let raw_hex = response
            .result
            .as_ref()
            .and_then(|r| r.as_str())
            .ok_or_else(|| ChainError::Protocol("transaction.get: result not a string".to_string()))?;
        let raw = hex::decode(raw_hex)
            .map_err(|e| ChainError::Protocol(format!("transaction.get: bad hex: {}", e)))?;

        self.tx_cache.lock().await.insert(*txid, raw.clone());
        Ok(raw)
    }

    async fn fetch_ref(&self, contract_ref: &ContractRef) -> ChainResult<RefLocation> {
        let response = self
            .send_request(
                ChainMethod::RefGet,
                vec![Value::String(hex::encode(contract_ref))],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Protocol(message));
        }

        let result = response
            .result
            .as_ref()
            .ok_or_else(|| ChainError::Protocol("ref.get: empty result".to_string()))?;
        let first = parse_outpoint(
            result
                .get("first")
                .ok_or_else(|| ChainError::Protocol("ref.get: missing first".to_string()))?,
        )?;
        let current = parse_outpoint(
            result
                .get("current")
                .ok_or_else(|| ChainError::Protocol("ref.get: missing current".to_string()))?,
        )?;
        Ok(RefLocation { first, current })
    }

    async fn subscribe(&self, script_hash: &str) -> ChainResult<()> {
        let response = self
            .send_request(
                ChainMethod::ScriptHashSubscribe,
                vec![Value::String(script_hash.to_string())],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Protocol(message));
        }

        // The reply carries the current status; feed it through the same
        // channel so the first state load follows the usual path.
        let status = response.result.as_ref().and_then(|v| v.as_str()).map(|s| s.to_string());
        let _ = self
            .events
            .send(ChainEvent::Status { script_hash: script_hash.to_string(), status })
            .await;
        Ok(())
    }

    async fn unsubscribe(&self, script_hash: &str) -> ChainResult<()> {
        let response = self
            .send_request(
                ChainMethod::ScriptHashUnsubscribe,
                vec![Value::String(script_hash.to_string())],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Protocol(message));
        }
        Ok(())
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> ChainResult<[u8; 32]> {
        let response = self
            .send_request(
                ChainMethod::TransactionBroadcast,
                vec![Value::String(hex::encode(raw_tx))],
            )
            .await?;
        if let Some(message) = response.error_message() {
            return Err(ChainError::Rejected(message));
        }

        let txid_hex = response
            .result
            .as_ref()
            .and_then(|r| r.as_str())
            .ok_or_else(|| ChainError::Protocol("broadcast: result not a string".to_string()))?;
        display_hex_to_txid(txid_hex)
    }
}

/// Wallet backed by a single private key and the gateway's unspent index.
pub struct KeyWallet {
    secret: SecretKey,
    pubkey_hash: [u8; 20],
    client: Arc<ElectrumClient>,
}

impl KeyWallet {
    pub fn new(secret: SecretKey, client: Arc<ElectrumClient>) -> Self {
        let secp = Secp256k1::new();
        let pubkey = secret.public_key(&secp);
        let pubkey_hash = hash160(&pubkey.serialize());
        KeyWallet { secret, pubkey_hash, client }
    }
}

impl Wallet for KeyWallet {
    fn address(&self) -> String {
        format!("pkh:{}", hex::encode(self.pubkey_hash))
    }

    fn pubkey_hash(&self) -> [u8; 20] {
        self.pubkey_hash
    }

    fn change_script(&self) -> Vec<u8> {
        script::build_p2pkh_script(&self.pubkey_hash)
    }

    fn signing_key(&self) -> SecretKey {
        self.secret
    }

    async fn unspent(&self) -> ChainResult<WalletSnapshot> {
        let hash = script::script_hash(&self.change_script());
        let utxos = self.client.list_unspent(&hash).await?;
        Ok(WalletSnapshot { utxos })
    }
}

/// RIPEMD160(SHA256(data)), the standard public-key hash.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::Ripemd160;
    use sha2::{Digest, Sha256};
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}
