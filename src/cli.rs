use clap::Parser;
use colored::*;

/// dmint-miner - GPU miner for decentralized-mint token contracts
#[derive(Parser, Debug)]
#[command(name = "dmint-miner")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client-side GPU miner for dMint token contracts", long_about = None)]
pub struct Args {
    /// Contract reference (72 hex chars: txid plus little-endian vout)
    #[arg(short = 'c', long, value_name = "REF")]
    pub contract: String,

    /// Mining algorithm (sha256d, blake3, k12)
    #[arg(short, long, default_value = "sha256d", value_name = "ALGORITHM")]
    pub algo: String,

    /// Initial difficulty when the token metadata declares none
    #[arg(short, long, default_value_t = 1u128, value_name = "DIFFICULTY")]
    pub diff: u128,

    /// Difficulty adjustment mode (fixed, epoch, asert, lwma, schedule)
    #[arg(long, default_value = "fixed", value_name = "MODE")]
    pub daa: String,

    /// Target seconds per mint for the adjustment modes
    #[arg(long, default_value_t = 300, value_name = "SECONDS")]
    pub target_time: u64,

    /// Device workgroups dispatched per batch
    #[arg(short, long, value_name = "WORKGROUPS")]
    pub threads: Option<u32>,

    /// Chain servers, host:port, tried in order
    #[arg(short = 's', long = "server", value_name = "HOST:PORT")]
    pub servers: Vec<String>,

    /// Mining private key (64 hex chars)
    #[arg(short = 'k', long, value_name = "KEY")]
    pub key: String,

    /// Message embedded in every mint
    #[arg(short, long, default_value = "", value_name = "TEXT")]
    pub message: String,

    /// GPU device index
    #[arg(long, default_value_t = 0, value_name = "INDEX")]
    pub gpu: usize,

    /// Memory ceiling in MiB, reserved for future memory-hard algorithms
    #[arg(long, value_name = "MIB")]
    pub max_memory: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

/// Operator state persisted between runs as one JSON blob.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub mnemonic: Option<String>,
}

impl Settings {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Process exit codes.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const UNSUPPORTED_ALGORITHM: i32 = 2;
    pub const DEVICE_UNAVAILABLE: i32 = 3;
    pub const INTERRUPTED: i32 = 130;
}

pub fn display_banner() {
    println!(
        "\n{}",
        "==================================================".bright_cyan()
    );
    println!(
        "  {}  {}",
        "dmint-miner".bright_white().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_green()
    );
    println!("  {}", "proof-of-work mints for dMint contracts".yellow());
    println!(
        "{}\n",
        "==================================================".bright_cyan()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from([
            "dmint-miner",
            "--contract",
            "00ff",
            "--key",
            "11",
            "--server",
            "localhost:50010",
        ]);
        assert_eq!(args.algo, "sha256d");
        assert_eq!(args.daa, "fixed");
        assert_eq!(args.diff, 1);
        assert_eq!(args.servers, vec!["localhost:50010".to_string()]);
    }

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings {
            address: Some("pkh:ab".to_string()),
            message: Some("gm".to_string()),
            servers: vec!["a:1".to_string(), "b:2".to_string()],
            discovery_url: None,
            mnemonic: Some("seed words".to_string()),
        };
        let json = settings.to_json().unwrap();
        let back = Settings::from_json(&json).unwrap();
        assert_eq!(back.servers, settings.servers);
        assert_eq!(back.address, settings.address);
        assert_eq!(back.mnemonic, settings.mnemonic);
    }
}
