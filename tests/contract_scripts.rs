//! Contract script template round-trips and sibling recognition over the
//! public crate surface.

use dmint_miner::algo::{Algorithm, Target, TargetFormat};
use dmint_miner::contract::script::{
    build_burn_script, build_message_script, build_state_script, parse_state_script, scan_outputs,
    ScriptError,
};
use dmint_miner::contract::{StateHeader, REF_LEN};

fn v1_header(height: u64, difficulty: u128) -> StateHeader {
    StateHeader {
        height,
        contract_ref: [0xa1; REF_LEN],
        token_ref: [0xb2; REF_LEN],
        max_height: 21_000,
        reward: 100_000,
        target: Target::from_difficulty(TargetFormat::LegacyV1, difficulty),
        algorithm: Algorithm::Sha256d,
        last_time: None,
        target_time: None,
    }
}

fn v2_header(algorithm: Algorithm) -> StateHeader {
    StateHeader {
        height: 512,
        contract_ref: [0x0f; REF_LEN],
        token_ref: [0xf0; REF_LEN],
        max_height: 100_000,
        reward: 10_000,
        target: Target::from_difficulty(TargetFormat::Full256, 987_654),
        algorithm,
        last_time: Some(1_722_000_000),
        target_time: Some(120),
    }
}

#[test]
fn every_in_range_state_round_trips() {
    for (height, difficulty) in [(0u64, 1u128), (1, 2), (500, 5_000), (20_999, u32::MAX as u128)] {
        let header = v1_header(height, difficulty);
        let script = build_state_script(&header);
        let parsed = parse_state_script(&script, &header.contract_ref).unwrap();
        assert_eq!(parsed, header, "height {} difficulty {}", height, difficulty);
    }

    for algorithm in [Algorithm::Blake3, Algorithm::K12] {
        let header = v2_header(algorithm);
        let script = build_state_script(&header);
        let parsed = parse_state_script(&script, &header.contract_ref).unwrap();
        assert_eq!(parsed, header, "{}", algorithm);
    }
}

#[test]
fn foreign_scripts_are_not_contracts() {
    let header = v1_header(5, 100);

    // Arbitrary bytes.
    assert!(matches!(
        parse_state_script(&[0x76, 0xa9, 0x14], &header.contract_ref),
        Err(ScriptError::NotAContract)
    ));

    // The right tail but a corrupted separator.
    let mut script = build_state_script(&header);
    let sep = script.len() - 56 - 1;
    script[sep] = 0x51;
    assert!(matches!(
        parse_state_script(&script, &header.contract_ref),
        Err(ScriptError::NotAContract)
    ));
}

#[test]
fn invariants_are_enforced_on_decode() {
    let mut over = v1_header(10, 100);
    over.height = over.max_height + 5;
    let script = build_state_script(&over);
    assert!(parse_state_script(&script, &over.contract_ref).is_err());

    let mut zero_target = v1_header(10, 100);
    zero_target.target = Target::Legacy(0);
    let script = build_state_script(&zero_target);
    assert!(parse_state_script(&script, &zero_target.contract_ref).is_err());
}

#[test]
fn terminal_transaction_is_burn_only() {
    let contract_ref = [0x77; REF_LEN];
    let outputs = vec![
        (0u64, build_burn_script(&contract_ref)),
        (0u64, build_message_script("so long")),
        (900u64, vec![0x76, 0xa9]),
    ];
    let (state, burn, message) = scan_outputs(&outputs, &contract_ref).unwrap();
    assert!(state.is_none());
    assert_eq!(burn, Some(contract_ref));
    assert_eq!(message.as_deref(), Some("so long"));
}

#[test]
fn regular_mint_transaction_carries_state_and_message() {
    let header = v2_header(Algorithm::Blake3);
    let outputs = vec![
        (546u64, build_state_script(&header)),
        (0u64, build_message_script("height 512")),
    ];
    let (state, burn, message) = scan_outputs(&outputs, &header.contract_ref).unwrap();
    let (vout, parsed) = state.unwrap();
    assert_eq!(vout, 0);
    assert_eq!(parsed, header);
    assert!(burn.is_none());
    assert_eq!(message.as_deref(), Some("height 512"));
}

#[test]
fn burn_for_another_reference_is_ignored() {
    let ours = [0x11; REF_LEN];
    let theirs = [0x22; REF_LEN];
    let outputs = vec![(0u64, build_burn_script(&theirs))];
    let (state, burn, _) = scan_outputs(&outputs, &ours).unwrap();
    assert!(state.is_none());
    assert!(burn.is_none());
}
