use clap::Parser;

/// Magpie — restartable Bitcoin blockchain indexer over the p2p network.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/config.toml", env = "MAGPIE_CONFIG")]
    pub config: std::path::PathBuf,

    /// Network to join and index.
    #[arg(long, value_enum, default_value = "mainnet", env = "MAGPIE_CHAIN")]
    pub chain: Chain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Chain {
    Mainnet,
    Testnet,
    Regtest,
    Signet,
}

impl Chain {
    pub fn network(self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
            Self::Regtest => bitcoin::Network::Regtest,
            Self::Signet => bitcoin::Network::Signet,
        }
    }
}
