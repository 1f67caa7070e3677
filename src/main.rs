use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use colored::*;
use secp256k1::SecretKey;
use tokio::sync::mpsc;

use dmint_miner::algo::{self, Algorithm};
use dmint_miner::chain::electrumx::{ElectrumClient, ElectrumConfig, KeyWallet};
use dmint_miner::chain::ChainGateway;
use dmint_miner::claim::parse_tx_outputs;
use dmint_miner::cli::{display_banner, exit_code, Args};
use dmint_miner::contract::{script, ContractState, OutPoint, REF_LEN};
use dmint_miner::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
use dmint_miner::daa::{DaaMode, DaaParams};
use dmint_miner::engine::driver::SearchDriver;
use dmint_miner::engine::{DeviceError, EngineHandle, SearchDevice};

#[cfg(feature = "opencl")]
fn open_device(index: usize) -> Result<Box<dyn SearchDevice>, DeviceError> {
    use dmint_miner::engine::opencl::OpenClDevice;
    Ok(Box::new(OpenClDevice::new(index)?))
}

#[cfg(not(feature = "opencl"))]
fn open_device(_index: usize) -> Result<Box<dyn SearchDevice>, DeviceError> {
    Err(DeviceError::Unavailable(
        "built without the opencl feature; rebuild with --features opencl".to_string(),
    ))
}

fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "sha256d" => Some(Algorithm::Sha256d),
        "blake3" => Some(Algorithm::Blake3),
        "k12" => Some(Algorithm::K12),
        "argon2id-light" | "argon2" => Some(Algorithm::Argon2Light),
        _ => None,
    }
}

fn parse_daa_mode(name: &str) -> Option<DaaMode> {
    match name {
        "fixed" => Some(DaaMode::Fixed),
        "epoch" => Some(DaaMode::Epoch),
        "asert" => Some(DaaMode::Asert),
        "lwma" => Some(DaaMode::Lwma),
        "schedule" => Some(DaaMode::Schedule),
        _ => None,
    }
}

fn parse_contract_ref(s: &str) -> Option<[u8; REF_LEN]> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != REF_LEN {
        return None;
    }
    let mut r = [0u8; REF_LEN];
    r.copy_from_slice(&bytes);
    Some(r)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if args.debug { "debug" } else { "info" })
            }),
        )
        .init();

    if args.no_color {
        colored::control::set_override(false);
    }

    display_banner();

    // Configuration surface, validated before anything touches hardware
    // or the network.
    let Some(cli_algorithm) = parse_algorithm(&args.algo) else {
        eprintln!("{} unknown algorithm: {}", "error:".red().bold(), args.algo);
        std::process::exit(exit_code::UNSUPPORTED_ALGORITHM);
    };
    if let Err(e) = algo::spec_for(cli_algorithm) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(exit_code::UNSUPPORTED_ALGORITHM);
    }

    let Some(daa_mode) = parse_daa_mode(&args.daa) else {
        eprintln!("{} unknown DAA mode: {}", "error:".red().bold(), args.daa);
        std::process::exit(exit_code::CONFIG);
    };
    let daa_params = DaaParams {
        mode: daa_mode,
        target_block_time: args.target_time,
        ..DaaParams::default()
    };
    if let Err(e) = daa_params.validate() {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(exit_code::CONFIG);
    }

    let Some(contract_ref) = parse_contract_ref(&args.contract) else {
        eprintln!(
            "{} contract reference must be {} hex chars",
            "error:".red().bold(),
            REF_LEN * 2
        );
        std::process::exit(exit_code::CONFIG);
    };

    let secret = match hex::decode(&args.key).ok().and_then(|b| SecretKey::from_slice(&b).ok()) {
        Some(key) => key,
        None => {
            eprintln!("{} invalid mining key", "error:".red().bold());
            std::process::exit(exit_code::CONFIG);
        }
    };

    if args.servers.is_empty() {
        eprintln!("{} at least one --server is required", "error:".red().bold());
        std::process::exit(exit_code::CONFIG);
    }

    // The device is opened before any network traffic so a missing GPU
    // fails fast.
    let device = match open_device(args.gpu) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(exit_code::DEVICE_UNAVAILABLE);
        }
    };
    let info = device.info();
    println!(
        "{:<12} {} ({} CU)",
        "Device:".green(),
        info.name.bright_white(),
        info.compute_units
    );
    println!("{:<12} {}", "Algorithm:".green(), args.algo.bright_white());
    println!("{:<12} {}", "DAA:".green(), args.daa.bright_white());
    println!();

    let (event_tx, event_rx) = mpsc::channel(64);
    let (candidate_tx, candidate_rx) = mpsc::channel(64);

    let client = Arc::new(ElectrumClient::new(
        ElectrumConfig::new(args.servers.clone()),
        event_tx,
    ));
    client.connect_any().await?;

    let wallet = KeyWallet::new(secret, client.clone());

    // Bootstrap the contract state from its current location.
    let location = client.fetch_ref(&contract_ref).await?;
    let raw = client.fetch_tx(&location.current.txid, true).await?;
    let outputs = parse_tx_outputs(&raw)?;
    let (found_state, burn, message) = script::scan_outputs(&outputs, &contract_ref)?;

    let state = match (found_state, burn) {
        (Some((vout, header)), _) => {
            if header.algorithm != cli_algorithm {
                tracing::warn!(
                    "contract declares {}, overriding --algo {}",
                    header.algorithm,
                    args.algo
                );
            }
            if let Err(e) = algo::spec_for(header.algorithm) {
                eprintln!("{} {}", "error:".red().bold(), e);
                std::process::exit(exit_code::UNSUPPORTED_ALGORITHM);
            }
            let mut state = ContractState::new(
                header,
                OutPoint::new(location.current.txid, vout),
            );
            state.message = message;
            state
        }
        (None, Some(_)) => {
            println!("{}", "contract is minted out".yellow().bold());
            std::process::exit(exit_code::OK);
        }
        (None, None) => {
            eprintln!(
                "{} reference does not resolve to a dmint contract",
                "error:".red().bold()
            );
            std::process::exit(exit_code::CONFIG);
        }
    };

    println!(
        "{:<12} {} / {} minted, reward {} photons",
        "Contract:".green(),
        state.header.height,
        state.header.max_height,
        state.header.reward
    );

    let engine = EngineHandle::new();
    let driver = SearchDriver::new(device, engine.clone(), candidate_tx, args.threads);

    let mut coordinator = Coordinator::new(
        client.clone(),
        wallet,
        CoordinatorConfig::default(),
        daa_params,
        state,
        engine.clone(),
        args.message.clone(),
    );
    let counters = coordinator.counters();

    if let Err(e) = coordinator.start().await {
        match e {
            CoordinatorError::BalanceTooLow { balance } => {
                eprintln!(
                    "{} wallet balance {} photons is below the mining minimum",
                    "error:".red().bold(),
                    balance
                );
                std::process::exit(exit_code::CONFIG);
            }
            other => return Err(other.into()),
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n{}", "interrupt received, shutting down".yellow().bold());
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let driver_task = tokio::spawn(driver.run());
    let coordinator_task = tokio::spawn(coordinator.run(candidate_rx, event_rx, shutdown.clone()));

    // Periodic statistics until the coordinator winds down.
    let started = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_secs(15)).await;
        if coordinator_task.is_finished() || shutdown.load(Ordering::SeqCst) {
            break;
        }
        let rate = engine.hash_rate();
        println!(
            "[{}] {:>10.2} MH/s   accepted {}   rejected {}   up {}",
            chrono::Local::now().format("%H:%M:%S"),
            rate / 1_000_000.0,
            counters.accepted(),
            counters.rejected(),
            humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()))
        );
    }

    let result = coordinator_task.await;
    driver_task.abort();

    match result {
        Ok(Ok(())) => {
            if shutdown.load(Ordering::SeqCst) {
                std::process::exit(exit_code::INTERRUPTED);
            }
            Ok(())
        }
        Ok(Err(e)) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(exit_code::CONFIG);
        }
        Err(e) => {
            eprintln!("{} coordinator task failed: {}", "error:".red().bold(), e);
            std::process::exit(exit_code::CONFIG);
        }
    }
}
