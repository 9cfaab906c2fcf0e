//! Per-network chain parameters consumed by the sync engine.
//!
//! Covers what the engine needs from a network definition: the wire
//! magic, the default p2p port, the DNS seed list for discovery, the
//! hard-coded checkpoint table that anchors header requests, and the
//! genesis block (delegated to `bitcoin::blockdata::constants`).

use std::str::FromStr;

use bitcoin::p2p::Magic;
use bitcoin::{Block, BlockHash, Network};

// ==============================================================================
// Checkpoints
// ==============================================================================

/// A hard-coded (height, hash) anchor from the chain parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: BlockHash,
}

/// Mainnet checkpoints, mirroring the reference-node table.
const MAINNET_CHECKPOINTS: &[(i32, &str)] = &[
    (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
    (168000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
    (193000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
    (210000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
    (216116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
    (225430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
    (250000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
    (267300, "000000000000000a83fbd660e918f218bf37edd92b748ad940483c7c116179ac"),
    (279000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
    (300255, "0000000000000000162804527c6e9b9f0563a280525f9d08c12041def0a0f3b2"),
    (319400, "000000000000000021c6052e9becade189495d1c539aa37c58917305fd15f13b"),
    (343185, "0000000000000000072b8bf361d01a6ba7d445dd024203fafc78768ed4368554"),
    (352940, "000000000000000010755df42dba556bb72be6a32f3ce0b6941ce4430152c9ff"),
    (382320, "00000000000000000a8dc6ed5b133d0eb2fd6af56203e4159789b092defd8ab2"),
    (400000, "000000000000000004ec466ce4732fe6f1ed1cddc2ed4b328fff5224276e3f6f"),
    (430000, "000000000000000001868b2bb3a285f3cc6b33ea234eb70facf4dcdf22186b87"),
    (460000, "000000000000000000ef751bbce8e744ad303c47ece06c8d863e4d417efc258c"),
    (490000, "000000000000000000de069137b17b8d5a3dfbd5b145b2dcfb203f15d0c4de90"),
    (525000, "0000000000000000002130f9936f9a583610580ac1b31de51d7bd75b05f16222"),
    (550000, "000000000000000000223b7a2298fb1c6c75fb0efc28a4c56853ff4112ec6bc9"),
    (560000, "0000000000000000002c7b276daf6efb2b6aa68e2ce3be67ef925b3264ae7122"),
];

const TESTNET_CHECKPOINTS: &[(i32, &str)] = &[
    (546, "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
    (100000, "00000000009e2958c15ff9290d571bf9459e93b19765c6801ddeccadbb160a1e"),
    (200000, "0000000000287bffd321963ef05feab753ebe274e1d78b2fd4e2bfe9ad3aa6f2"),
];

// ==============================================================================
// DNS Seeds
// ==============================================================================

const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitnodes.io",
    "seed.bitcoin.jonasschnelli.ch",
];

const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "testnet-seed.bluematt.me",
];

const SIGNET_DNS_SEEDS: &[&str] = &["seed.signet.bitcoin.sprovoost.nl"];

// ==============================================================================
// Chain Parameters
// ==============================================================================

/// Network definition the sync engine runs against.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub magic: Magic,
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    checkpoints: Vec<Checkpoint>,
}

impl ChainParams {
    pub fn new(network: Network) -> Self {
        let (default_port, dns_seeds, table): (u16, &'static [&'static str], &[(i32, &str)]) =
            match network {
                Network::Bitcoin => (8333, MAINNET_DNS_SEEDS, MAINNET_CHECKPOINTS),
                Network::Testnet => (18333, TESTNET_DNS_SEEDS, TESTNET_CHECKPOINTS),
                Network::Regtest => (18444, &[], &[]),
                Network::Signet => (38333, SIGNET_DNS_SEEDS, &[]),
                _ => (8333, &[], &[]),
            };
        let checkpoints = table
            .iter()
            .map(|(height, hash)| Checkpoint {
                height: *height,
                hash: BlockHash::from_str(hash).expect("hard-coded checkpoint hash is valid"),
            })
            .collect();
        Self {
            network,
            magic: Magic::from(network),
            default_port,
            dns_seeds,
            checkpoints,
        }
    }

    /// The network's genesis block.
    pub fn genesis_block(&self) -> Block {
        bitcoin::blockdata::constants::genesis_block(self.network)
    }

    /// Hard-coded checkpoints in ascending height order.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }
}
