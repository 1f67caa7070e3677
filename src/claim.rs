//! Claim transaction assembly and signing.
//!
//! A claim spends the contract UTXO with the winning nonce, re-creates
//! the next state (or the burn marker on the terminal mint), pays the
//! token reward to the miner, commits the annotation output and returns
//! change. Wallet inputs are signed with the forkid sighash so the
//! signatures stay valid off the legacy chain.

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::chain::WalletSnapshot;
use crate::contract::script::{self, ScriptError};
use crate::contract::{ContractState, OutPoint, StateHeader};
use crate::algo::preimage::sha256d;

/// Fee rate in photons per kilobyte of transaction.
pub const FEE_PER_KB: u64 = 5_000_000;

pub const TX_VERSION: u32 = 2;
const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const SIGHASH_ALL_FORKID: u32 = 0x41;

/// Size allowance per unsigned wallet input script: DER signature with
/// hashtype plus a compressed public key, both pushed.
const P2PKH_SCRIPT_SIG_SIZE: usize = 107;

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("insufficient funds: need {needed} photons, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("malformed transaction: {0}")]
    Malformed(&'static str),

    #[error("signing failed: {0}")]
    Signing(String),
}

struct TxInput {
    outpoint: OutPoint,
    script_sig: Vec<u8>,
    /// Locking script of the spent output, used as the sighash script code.
    script_pubkey: Vec<u8>,
    value: u64,
    signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// Everything the coordinator feeds into one claim attempt.
pub struct ClaimRequest<'a> {
    pub state: &'a ContractState,
    /// `None` builds the terminal burn output instead of a next state.
    pub next_header: Option<StateHeader>,
    pub nonce: u64,
    /// The miner's locking script committed in the proof-of-work preimage.
    pub input_script: &'a [u8],
    /// The annotation output committed in the preimage; re-used verbatim
    /// as output 2.
    pub output_script: &'a [u8],
    /// Photons carried by the contract UTXO itself.
    pub contract_value: u64,
    pub snapshot: &'a WalletSnapshot,
    pub pubkey_hash: [u8; 20],
    pub change_script: Vec<u8>,
}

/// A signed, serialized claim.
#[derive(Debug, Clone)]
pub struct BuiltClaim {
    pub raw: Vec<u8>,
    /// Wire-order txid.
    pub txid: [u8; 32],
    pub fee: u64,
    pub change: u64,
}

/// Assemble and sign a claim transaction.
pub fn build_claim(request: &ClaimRequest<'_>, key: &SecretKey) -> Result<BuiltClaim, ClaimError> {
    let header = &request.state.header;

    let mut inputs = Vec::with_capacity(1 + request.snapshot.utxos.len());
    inputs.push(TxInput {
        outpoint: request.state.location,
        script_sig: contract_script_sig(request.nonce, request.input_script, request.output_script),
        script_pubkey: script::build_state_script(header),
        value: request.contract_value,
        signed: false,
    });
    for utxo in &request.snapshot.utxos {
        inputs.push(TxInput {
            outpoint: OutPoint::new(utxo.txid, utxo.vout),
            script_sig: Vec::new(),
            script_pubkey: request.change_script.clone(),
            value: utxo.value,
            signed: true,
        });
    }

    let state_output = match &request.next_header {
        Some(next) => TxOutput {
            value: request.contract_value,
            script_pubkey: script::build_state_script(next),
        },
        None => TxOutput {
            value: 0,
            script_pubkey: script::build_burn_script(&header.contract_ref),
        },
    };
    let reward_output = TxOutput {
        value: header.reward,
        script_pubkey: script::build_reward_script(&request.pubkey_hash, &header.token_ref),
    };
    let message_output = TxOutput { value: 0, script_pubkey: request.output_script.to_vec() };

    let mut outputs = vec![state_output, reward_output, message_output];

    // Change is solved together with the fee: estimate the signed size
    // with the change output in place, then balance.
    outputs.push(TxOutput { value: 0, script_pubkey: request.change_script.clone() });

    let estimated = estimate_size(&inputs, &outputs);
    let fee = fee_for_size(estimated);

    let total_in: u64 = inputs.iter().map(|i| i.value).sum();
    let committed: u64 = outputs.iter().map(|o| o.value).sum();
    let needed = committed + fee;
    if total_in < needed {
        return Err(ClaimError::InsufficientFunds { needed, available: total_in });
    }
    let change = total_in - needed;
    if let Some(change_output) = outputs.last_mut() {
        change_output.value = change;
    }

    sign_wallet_inputs(&mut inputs, &outputs, key)?;

    let raw = serialize_tx(&inputs, &outputs);
    let txid = sha256d(&raw);
    Ok(BuiltClaim { raw, txid, fee, change })
}

/// `<nonce> <sha256d(input_script)> <sha256d(output_script)> 0`
fn contract_script_sig(nonce: u64, input_script: &[u8], output_script: &[u8]) -> Vec<u8> {
    let mut sig = Vec::with_capacity(9 + 33 + 33 + 1);
    script::push_data(&mut sig, &nonce.to_le_bytes());
    script::push_data(&mut sig, &sha256d(input_script));
    script::push_data(&mut sig, &sha256d(output_script));
    sig.push(script::OP_0);
    sig
}

fn estimate_size(inputs: &[TxInput], outputs: &[TxOutput]) -> usize {
    let mut size = 4 + 4; // version + locktime
    size += varint_len(inputs.len() as u64);
    for input in inputs {
        let script_len = if input.signed { P2PKH_SCRIPT_SIG_SIZE } else { input.script_sig.len() };
        size += 32 + 4 + varint_len(script_len as u64) + script_len + 4;
    }
    size += varint_len(outputs.len() as u64);
    for output in outputs {
        size += 8 + varint_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
    }
    size
}

/// Round the fee up to the next photon for the rate.
fn fee_for_size(size: usize) -> u64 {
    (size as u64 * FEE_PER_KB).div_ceil(1000)
}

fn sign_wallet_inputs(
    inputs: &mut [TxInput],
    outputs: &[TxOutput],
    key: &SecretKey,
) -> Result<(), ClaimError> {
    let secp = Secp256k1::new();
    let pubkey = PublicKey::from_secret_key(&secp, key);
    let pubkey_bytes = pubkey.serialize();

    let hash_prevouts = hash_prevouts(inputs);
    let hash_sequence = hash_sequences(inputs);
    let hash_outputs = hash_outputs(outputs);

    for index in 0..inputs.len() {
        if !inputs[index].signed {
            continue;
        }
        let digest = sighash_forkid(
            &inputs[index],
            &hash_prevouts,
            &hash_sequence,
            &hash_outputs,
        );
        let message = Message::from_digest(digest);
        let signature = secp.sign_ecdsa(&message, key);
        let mut der = signature.serialize_der().to_vec();
        der.push(SIGHASH_ALL_FORKID as u8);

        let mut script_sig = Vec::with_capacity(der.len() + pubkey_bytes.len() + 2);
        script::push_data(&mut script_sig, &der);
        script::push_data(&mut script_sig, &pubkey_bytes);
        inputs[index].script_sig = script_sig;
    }
    Ok(())
}

fn hash_prevouts(inputs: &[TxInput]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(inputs.len() * 36);
    for input in inputs {
        buf.extend_from_slice(&input.outpoint.txid);
        buf.extend_from_slice(&input.outpoint.vout.to_le_bytes());
    }
    sha256d(&buf)
}

fn hash_sequences(inputs: &[TxInput]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(inputs.len() * 4);
    for _ in inputs {
        buf.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    }
    sha256d(&buf)
}

fn hash_outputs(outputs: &[TxOutput]) -> [u8; 32] {
    let mut buf = Vec::new();
    for output in outputs {
        buf.extend_from_slice(&output.value.to_le_bytes());
        write_varint(&mut buf, output.script_pubkey.len() as u64);
        buf.extend_from_slice(&output.script_pubkey);
    }
    sha256d(&buf)
}

/// BIP143-shaped digest with the forkid hash type.
fn sighash_forkid(
    input: &TxInput,
    hash_prevouts: &[u8; 32],
    hash_sequence: &[u8; 32],
    hash_outputs: &[u8; 32],
) -> [u8; 32] {
    let mut buf = Vec::with_capacity(160 + input.script_pubkey.len());
    buf.extend_from_slice(&TX_VERSION.to_le_bytes());
    buf.extend_from_slice(hash_prevouts);
    buf.extend_from_slice(hash_sequence);
    buf.extend_from_slice(&input.outpoint.txid);
    buf.extend_from_slice(&input.outpoint.vout.to_le_bytes());
    write_varint(&mut buf, input.script_pubkey.len() as u64);
    buf.extend_from_slice(&input.script_pubkey);
    buf.extend_from_slice(&input.value.to_le_bytes());
    buf.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    buf.extend_from_slice(hash_outputs);
    buf.extend_from_slice(&0u32.to_le_bytes()); // locktime
    buf.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());
    sha256d(&buf)
}

fn serialize_tx(inputs: &[TxInput], outputs: &[TxOutput]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(estimate_size(inputs, outputs));

    raw.extend_from_slice(&TX_VERSION.to_le_bytes());

    write_varint(&mut raw, inputs.len() as u64);
    for input in inputs {
        raw.extend_from_slice(&input.outpoint.txid);
        raw.extend_from_slice(&input.outpoint.vout.to_le_bytes());
        write_varint(&mut raw, input.script_sig.len() as u64);
        raw.extend_from_slice(&input.script_sig);
        raw.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
    }

    write_varint(&mut raw, outputs.len() as u64);
    for output in outputs {
        raw.extend_from_slice(&output.value.to_le_bytes());
        write_varint(&mut raw, output.script_pubkey.len() as u64);
        raw.extend_from_slice(&output.script_pubkey);
    }

    raw.extend_from_slice(&0u32.to_le_bytes()); // locktime
    raw
}

/// Decode the outputs of a raw transaction as `(value, script)` pairs.
pub fn parse_tx_outputs(raw: &[u8]) -> Result<Vec<(u64, Vec<u8>)>, ClaimError> {
    let mut cursor = 0usize;

    read_bytes(raw, &mut cursor, 4)?; // version

    let input_count = read_varint(raw, &mut cursor)?;
    for _ in 0..input_count {
        read_bytes(raw, &mut cursor, 36)?; // outpoint
        let script_len = read_varint(raw, &mut cursor)? as usize;
        read_bytes(raw, &mut cursor, script_len)?;
        read_bytes(raw, &mut cursor, 4)?; // sequence
    }

    let output_count = read_varint(raw, &mut cursor)?;
    let mut outputs = Vec::with_capacity(output_count as usize);
    for _ in 0..output_count {
        let value = read_u64_le(raw, &mut cursor)?;
        let script_len = read_varint(raw, &mut cursor)? as usize;
        let script = read_bytes(raw, &mut cursor, script_len)?.to_vec();
        outputs.push((value, script));
    }

    read_bytes(raw, &mut cursor, 4)?; // locktime
    Ok(outputs)
}

/// The value of one output of a raw transaction.
pub fn output_value(raw: &[u8], vout: u32) -> Result<u64, ClaimError> {
    let outputs = parse_tx_outputs(raw)?;
    outputs
        .get(vout as usize)
        .map(|(value, _)| *value)
        .ok_or(ClaimError::Malformed("output index out of range"))
}

fn read_bytes<'a>(raw: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], ClaimError> {
    let end = cursor
        .checked_add(len)
        .ok_or(ClaimError::Malformed("length overflow"))?;
    if raw.len() < end {
        return Err(ClaimError::Malformed("truncated transaction"));
    }
    let slice = &raw[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_u64_le(raw: &[u8], cursor: &mut usize) -> Result<u64, ClaimError> {
    let bytes = read_bytes(raw, cursor, 8)?;
    let mut le = [0u8; 8];
    le.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(le))
}

fn read_varint(raw: &[u8], cursor: &mut usize) -> Result<u64, ClaimError> {
    let first = read_bytes(raw, cursor, 1)?[0];
    Ok(match first {
        0xfd => {
            let bytes = read_bytes(raw, cursor, 2)?;
            u16::from_le_bytes([bytes[0], bytes[1]]) as u64
        }
        0xfe => {
            let bytes = read_bytes(raw, cursor, 4)?;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
        }
        0xff => read_u64_le(raw, cursor)?,
        small => small as u64,
    })
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn varint_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}
