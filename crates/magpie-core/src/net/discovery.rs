//! Peer discovery: resolve the chain's DNS seeds into candidate
//! addresses.
//!
//! Every seed resolves concurrently; results are emitted on a single
//! channel that closes once all resolutions have completed. Resolution
//! failures are warnings, never fatal — discovery continues across
//! broken seeds.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::NetworkError;

/// Candidate addresses are tagged as last seen three days ago so
/// downstream freshness heuristics treat seed-derived peers as stale.
const SEED_ADDRESS_AGE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// A peer address produced by DNS-seed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateAddress {
    pub addr: SocketAddr,
    pub last_seen: SystemTime,
}

/// Resolve `seeds` concurrently, emitting every A/AAAA result on
/// `candidates`. The channel closes when the last resolution finishes.
pub async fn lookup_peers(
    seeds: &'static [&'static str],
    default_port: u16,
    candidates: mpsc::Sender<CandidateAddress>,
) {
    let mut resolutions = JoinSet::new();
    for seed in seeds {
        let candidates = candidates.clone();
        resolutions.spawn(async move {
            match tokio::net::lookup_host((*seed, default_port)).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    tracing::info!(seed = *seed, count = addrs.len(), "resolved dns seed");
                    let last_seen = SystemTime::now() - SEED_ADDRESS_AGE;
                    for addr in addrs {
                        if candidates
                            .send(CandidateAddress { addr, last_seen })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(source) => {
                    let error = NetworkError::Resolve {
                        seed: (*seed).to_owned(),
                        source,
                    };
                    tracing::warn!(error = %error, "dns seed resolution failed");
                }
            }
        });
    }
    while resolutions.join_next().await.is_some() {}
    // `candidates` drops here, closing the channel for the consumer.
}
