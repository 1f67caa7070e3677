//! Locking-script template: parsing and reconstruction.
//!
//! The contract script is a pushed state prologue, a state separator
//! opcode, then a fixed bytecode tail. The tail is matched as an opaque
//! suffix token; the prologue is peeled push by push. The same routines
//! build the next-state output for a claim, so decode and encode must
//! round-trip exactly.

use primitive_types::U256;
use sha2::{Digest, Sha256};

use super::{ContractRef, StateHeader, REF_LEN};
use crate::algo::{Algorithm, Target};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_STATESEPARATOR: u8 = 0xbd;
pub const OP_PUSHINPUTREF: u8 = 0xd0;
pub const OP_PUSHINPUTREFSINGLETON: u8 = 0xd1;

/// Message payloads are cut at this length.
pub const MAX_MESSAGE_LEN: usize = 80;

/// The fixed dMint bytecode tail. Matched as an opaque suffix; its
/// opcode-level semantics are enforced by the chain, not by this client.
pub const DMINT_TAIL: [u8; 56] = [
    0x75, 0x51, 0xc0, 0xcf, 0x7c, 0xa9, 0x88, 0x7e, 0xa9, 0x7e, 0xaa, 0x7c, 0x87, 0x69, 0x00,
    0xcd, 0x00, 0xc8, 0x7e, 0xaa, 0x87, 0x69, 0x79, 0x76, 0x55, 0x79, 0xa2, 0x63, 0x55, 0x79,
    0x01, 0x20, 0x7f, 0x75, 0x78, 0x87, 0x69, 0x7c, 0x67, 0x51, 0xcc, 0x78, 0x88, 0x68, 0x7e,
    0x8c, 0x7f, 0x77, 0x76, 0x01, 0x14, 0x7f, 0x75, 0x87, 0x69, 0x51,
];

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("not a dmint contract script")]
    NotAContract,

    #[error("truncated script at offset {0}")]
    Truncated(usize),

    #[error("malformed push at offset {0}")]
    BadPush(usize),

    #[error("unexpected opcode 0x{found:02x} at offset {offset}, expected 0x{expected:02x}")]
    UnexpectedOpcode { offset: usize, expected: u8, found: u8 },

    #[error("contract reference does not match subscription")]
    RefMismatch,

    #[error("non-minimal or out-of-range script number")]
    BadNumber,

    #[error("state invariant violated: {0}")]
    StateInvariant(&'static str),

    #[error("unknown algorithm id in state: 0x{0:02x}")]
    UnknownAlgorithm(u8),
}

/// One template-relevant output of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOutput {
    /// A state output carrying the contract forward.
    State(StateHeader),
    /// The terminal burn marker for a reference.
    Burn(ContractRef),
    /// A sibling annotation.
    Message(String),
    /// Anything else.
    Other,
}

/// Classify a single output script against the known templates.
pub fn classify_output(script: &[u8], expected_ref: &ContractRef) -> Result<ParsedOutput, ScriptError> {
    if let Some(burn_ref) = parse_burn_script(script) {
        return Ok(ParsedOutput::Burn(burn_ref));
    }
    if let Some(message) = parse_message_script(script) {
        return Ok(ParsedOutput::Message(message));
    }
    match parse_state_script(script, expected_ref) {
        Ok(header) => Ok(ParsedOutput::State(header)),
        Err(ScriptError::NotAContract) => Ok(ParsedOutput::Other),
        Err(e) => Err(e),
    }
}

/// Walk every output of a transaction and pick out the contract pieces.
/// A transaction with a burn output and no state output is a terminal mint.
pub fn scan_outputs(
    outputs: &[(u64, Vec<u8>)],
    expected_ref: &ContractRef,
) -> Result<(Option<(u32, StateHeader)>, Option<ContractRef>, Option<String>), ScriptError> {
    let mut state = None;
    let mut burn = None;
    let mut message = None;
    for (vout, (_, script)) in outputs.iter().enumerate() {
        match classify_output(script, expected_ref)? {
            ParsedOutput::State(header) => {
                if state.is_none() {
                    state = Some((vout as u32, header));
                }
            }
            ParsedOutput::Burn(r) => {
                if r == *expected_ref {
                    burn = Some(r);
                }
            }
            ParsedOutput::Message(m) => {
                if message.is_none() {
                    message = Some(m);
                }
            }
            ParsedOutput::Other => {}
        }
    }
    Ok((state, burn, message))
}

/// Parse a full state script against the template tail.
pub fn parse_state_script(script: &[u8], expected_ref: &ContractRef) -> Result<StateHeader, ScriptError> {
    if script.len() < DMINT_TAIL.len() + 1 || !script.ends_with(&DMINT_TAIL) {
        return Err(ScriptError::NotAContract);
    }
    let sep_at = script.len() - DMINT_TAIL.len() - 1;
    if script[sep_at] != OP_STATESEPARATOR {
        return Err(ScriptError::NotAContract);
    }
    let prologue = &script[..sep_at];

    let mut cursor = 0usize;

    let height_bytes = read_push(prologue, &mut cursor)?;
    if height_bytes.len() != 4 {
        return Err(ScriptError::StateInvariant("height push must be 4 bytes"));
    }
    let height = u32::from_le_bytes([height_bytes[0], height_bytes[1], height_bytes[2], height_bytes[3]])
        as u64;

    let contract_ref = read_ref(prologue, &mut cursor, OP_PUSHINPUTREFSINGLETON)?;
    if contract_ref != *expected_ref {
        return Err(ScriptError::RefMismatch);
    }
    let token_ref = read_ref(prologue, &mut cursor, OP_PUSHINPUTREF)?;

    let mut pushes = Vec::new();
    while cursor < prologue.len() {
        pushes.push(read_push(prologue, &mut cursor)?);
    }

    let header = match pushes.len() {
        3 => {
            let max_height = decode_script_num(&pushes[0])?;
            let reward = decode_script_num(&pushes[1])?;
            let target = decode_script_num(&pushes[2])?;
            StateHeader {
                height,
                contract_ref,
                token_ref,
                max_height,
                reward,
                target: Target::Legacy(target),
                algorithm: Algorithm::Sha256d,
                last_time: None,
                target_time: None,
            }
        }
        6 => {
            let max_height = decode_script_num(&pushes[0])?;
            let reward = decode_script_num(&pushes[1])?;
            if pushes[2].len() != 32 {
                return Err(ScriptError::StateInvariant("v2 target push must be 32 bytes"));
            }
            let target = U256::from_big_endian(&pushes[2]);
            if pushes[3].len() != 1 {
                return Err(ScriptError::StateInvariant("algorithm push must be 1 byte"));
            }
            let algorithm = Algorithm::from_id(pushes[3][0])
                .map_err(|_| ScriptError::UnknownAlgorithm(pushes[3][0]))?;
            if pushes[4].len() != 4 {
                return Err(ScriptError::StateInvariant("last time push must be 4 bytes"));
            }
            let last_time =
                u32::from_le_bytes([pushes[4][0], pushes[4][1], pushes[4][2], pushes[4][3]]);
            let target_time = decode_script_num(&pushes[5])?;
            StateHeader {
                height,
                contract_ref,
                token_ref,
                max_height,
                reward,
                target: Target::Full(target),
                algorithm,
                last_time: Some(last_time),
                target_time: Some(target_time),
            }
        }
        _ => return Err(ScriptError::NotAContract),
    };

    header.validate()?;
    Ok(header)
}

/// Rebuild the locking script for a state header. Inverse of
/// [`parse_state_script`].
pub fn build_state_script(header: &StateHeader) -> Vec<u8> {
    let mut script = Vec::with_capacity(160 + DMINT_TAIL.len());

    push_data(&mut script, &(header.height as u32).to_le_bytes());
    script.push(OP_PUSHINPUTREFSINGLETON);
    script.extend_from_slice(&header.contract_ref);
    script.push(OP_PUSHINPUTREF);
    script.extend_from_slice(&header.token_ref);

    push_data(&mut script, &encode_script_num(header.max_height));
    push_data(&mut script, &encode_script_num(header.reward));

    match header.target {
        Target::Legacy(t) if header.is_v1() => {
            push_data(&mut script, &encode_script_num(t));
        }
        target => {
            let t = match target {
                Target::Full(t) => t,
                Target::Legacy(t) => U256::from(t),
            };
            let mut be = [0u8; 32];
            t.to_big_endian(&mut be);
            push_data(&mut script, &be);
            push_data(&mut script, &[header.algorithm.id()]);
            push_data(&mut script, &header.last_time.unwrap_or(0).to_le_bytes());
            push_data(&mut script, &encode_script_num(header.target_time.unwrap_or(0)));
        }
    }

    script.push(OP_STATESEPARATOR);
    script.extend_from_slice(&DMINT_TAIL);
    script
}

/// `OP_PUSHINPUTREFSINGLETON <ref> OP_RETURN`: the terminal burn marker.
pub fn build_burn_script(contract_ref: &ContractRef) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + REF_LEN);
    script.push(OP_PUSHINPUTREFSINGLETON);
    script.extend_from_slice(contract_ref);
    script.push(OP_RETURN);
    script
}

fn parse_burn_script(script: &[u8]) -> Option<ContractRef> {
    if script.len() != 2 + REF_LEN
        || script[0] != OP_PUSHINPUTREFSINGLETON
        || script[1 + REF_LEN] != OP_RETURN
    {
        return None;
    }
    let mut r = [0u8; REF_LEN];
    r.copy_from_slice(&script[1..1 + REF_LEN]);
    Some(r)
}

/// `OP_RETURN "msg" <utf8>`: a sibling annotation, payload cut to 80 bytes.
pub fn build_message_script(message: &str) -> Vec<u8> {
    let payload = truncate_utf8(message, MAX_MESSAGE_LEN);
    let mut script = Vec::with_capacity(6 + payload.len());
    script.push(OP_RETURN);
    push_data(&mut script, b"msg");
    push_data(&mut script, payload.as_bytes());
    script
}

fn parse_message_script(script: &[u8]) -> Option<String> {
    if script.first() != Some(&OP_RETURN) {
        return None;
    }
    let mut cursor = 1usize;
    let marker = read_push(script, &mut cursor).ok()?;
    if marker != b"msg" {
        return None;
    }
    let payload = read_push(script, &mut cursor).ok()?;
    if cursor != script.len() {
        return None;
    }
    let text = String::from_utf8(payload).ok()?;
    Some(truncate_utf8(&text, MAX_MESSAGE_LEN).to_string())
}

/// Standard pay-to-pubkey-hash locking script.
pub fn build_p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    push_data(&mut script, pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// The reward output: pay-to-pubkey-hash with the token reference bound
/// behind it, so the minted units stay in the token group.
pub fn build_reward_script(pubkey_hash: &[u8; 20], token_ref: &ContractRef) -> Vec<u8> {
    let mut script = build_p2pkh_script(pubkey_hash);
    script.push(OP_PUSHINPUTREF);
    script.extend_from_slice(token_ref);
    script
}

/// Electrum-style subscription key: sha256 of the script, reversed, hex.
pub fn script_hash(script: &[u8]) -> String {
    let mut digest: [u8; 32] = Sha256::digest(script).into();
    digest.reverse();
    hex::encode(digest)
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn read_ref(script: &[u8], cursor: &mut usize, opcode: u8) -> Result<ContractRef, ScriptError> {
    let offset = *cursor;
    let found = *script.get(offset).ok_or(ScriptError::Truncated(offset))?;
    if found != opcode {
        return Err(ScriptError::UnexpectedOpcode { offset, expected: opcode, found });
    }
    let start = offset + 1;
    let end = start + REF_LEN;
    if script.len() < end {
        return Err(ScriptError::Truncated(start));
    }
    let mut r = [0u8; REF_LEN];
    r.copy_from_slice(&script[start..end]);
    *cursor = end;
    Ok(r)
}

/// Read one push operation and return its payload.
fn read_push(script: &[u8], cursor: &mut usize) -> Result<Vec<u8>, ScriptError> {
    let offset = *cursor;
    let opcode = *script.get(offset).ok_or(ScriptError::Truncated(offset))?;
    let (len, data_at) = match opcode {
        OP_0 => (0usize, offset + 1),
        1..=0x4b => (opcode as usize, offset + 1),
        OP_PUSHDATA1 => {
            let l = *script.get(offset + 1).ok_or(ScriptError::Truncated(offset + 1))?;
            (l as usize, offset + 2)
        }
        OP_PUSHDATA2 => {
            if script.len() < offset + 3 {
                return Err(ScriptError::Truncated(offset + 1));
            }
            let l = u16::from_le_bytes([script[offset + 1], script[offset + 2]]);
            (l as usize, offset + 3)
        }
        _ => return Err(ScriptError::BadPush(offset)),
    };
    let end = data_at + len;
    if script.len() < end {
        return Err(ScriptError::Truncated(data_at));
    }
    *cursor = end;
    Ok(script[data_at..end].to_vec())
}

/// Append a minimally encoded data push.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        1..=0x4b => {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        _ => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Minimal script-number encoding: little-endian with a sign-bit pad.
pub fn encode_script_num(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut bytes = Vec::new();
    let mut n = value;
    while n > 0 {
        bytes.push((n & 0xff) as u8);
        n >>= 8;
    }
    if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        bytes.push(0x00);
    }
    bytes
}

/// Decode a minimally encoded non-negative script number.
pub fn decode_script_num(bytes: &[u8]) -> Result<u64, ScriptError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 9 {
        return Err(ScriptError::BadNumber);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        // Sign bit set means negative, which state fields never are.
        return Err(ScriptError::BadNumber);
    }
    // Reject non-minimal encodings like 0x01 0x00.
    if last == 0 && (bytes.len() < 2 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return Err(ScriptError::BadNumber);
    }
    let mut value: u128 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u128) << (8 * i);
    }
    u64::try_from(value).map_err(|_| ScriptError::BadNumber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::TargetFormat;

    fn v1_header() -> StateHeader {
        StateHeader {
            height: 41,
            contract_ref: [0xab; REF_LEN],
            token_ref: [0xcd; REF_LEN],
            max_height: 10_000,
            reward: 100_000,
            target: Target::from_difficulty(TargetFormat::LegacyV1, 5000),
            algorithm: Algorithm::Sha256d,
            last_time: None,
            target_time: None,
        }
    }

    fn v2_header() -> StateHeader {
        StateHeader {
            height: 900,
            contract_ref: [0x31; REF_LEN],
            token_ref: [0x32; REF_LEN],
            max_height: 42_000,
            reward: 25_000,
            target: Target::from_difficulty(TargetFormat::Full256, 123_456),
            algorithm: Algorithm::Blake3,
            last_time: Some(1_700_000_000),
            target_time: Some(300),
        }
    }

    #[test]
    fn test_v1_roundtrip() {
        let header = v1_header();
        let script = build_state_script(&header);
        let parsed = parse_state_script(&script, &header.contract_ref).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_v2_roundtrip() {
        let header = v2_header();
        let script = build_state_script(&header);
        let parsed = parse_state_script(&script, &header.contract_ref).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_tail_mismatch_is_not_a_contract() {
        let header = v1_header();
        let mut script = build_state_script(&header);
        let len = script.len();
        script[len - 1] ^= 0x01;
        assert!(matches!(
            parse_state_script(&script, &header.contract_ref),
            Err(ScriptError::NotAContract)
        ));
    }

    #[test]
    fn test_ref_mismatch_rejected() {
        let header = v1_header();
        let script = build_state_script(&header);
        let other = [0x00; REF_LEN];
        assert!(matches!(
            parse_state_script(&script, &other),
            Err(ScriptError::RefMismatch)
        ));
    }

    #[test]
    fn test_height_over_max_rejected() {
        let mut header = v1_header();
        header.height = header.max_height + 1;
        let script = build_state_script(&header);
        assert!(parse_state_script(&script, &header.contract_ref).is_err());
    }

    #[test]
    fn test_burn_roundtrip() {
        let r = [0x5a; REF_LEN];
        let script = build_burn_script(&r);
        assert_eq!(parse_burn_script(&script), Some(r));
        assert_eq!(
            classify_output(&script, &r).unwrap(),
            ParsedOutput::Burn(r)
        );
    }

    #[test]
    fn test_message_roundtrip_and_truncation() {
        let script = build_message_script("gl and hf");
        assert_eq!(parse_message_script(&script), Some("gl and hf".to_string()));

        let long = "x".repeat(200);
        let script = build_message_script(&long);
        let parsed = parse_message_script(&script).unwrap();
        assert_eq!(parsed.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_scan_outputs_terminal_mint() {
        let r = [0x77; REF_LEN];
        let outputs = vec![
            (0u64, build_burn_script(&r)),
            (0u64, build_message_script("last one")),
        ];
        let (state, burn, message) = scan_outputs(&outputs, &r).unwrap();
        assert!(state.is_none());
        assert_eq!(burn, Some(r));
        assert_eq!(message.as_deref(), Some("last one"));
    }

    #[test]
    fn test_scan_outputs_regular_mint() {
        let header = v2_header();
        let outputs = vec![
            (546u64, build_state_script(&header)),
            (header.reward, build_reward_script(&[9u8; 20], &header.token_ref)),
            (0u64, build_message_script("hi")),
        ];
        let (state, burn, _) = scan_outputs(&outputs, &header.contract_ref).unwrap();
        let (vout, parsed) = state.unwrap();
        assert_eq!(vout, 0);
        assert_eq!(parsed, header);
        assert!(burn.is_none());
    }

    #[test]
    fn test_script_num_roundtrip() {
        for v in [0u64, 1, 127, 128, 255, 256, 0x7fff, 0x8000, 1_000_000, u32::MAX as u64] {
            let e = encode_script_num(v);
            assert_eq!(decode_script_num(&e).unwrap(), v, "value {}", v);
        }
    }

    #[test]
    fn test_script_num_minimal_encoding() {
        assert_eq!(encode_script_num(127), vec![0x7f]);
        assert_eq!(encode_script_num(128), vec![0x80, 0x00]);
        assert!(decode_script_num(&[0x01, 0x00]).is_err());
        assert!(decode_script_num(&[0x80]).is_err());
    }

    #[test]
    fn test_script_hash_is_reversed_sha256() {
        let script = build_p2pkh_script(&[1u8; 20]);
        let h = script_hash(&script);
        let mut digest: [u8; 32] = Sha256::digest(&script).into();
        digest.reverse();
        assert_eq!(h, hex::encode(digest));
    }
}
