//! Networking: DNS-seed peer discovery, the outbound peer session, and
//! the inbound-message listener multiplexer.

pub mod discovery;
pub mod listener;
pub mod peer;
