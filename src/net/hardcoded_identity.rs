//! Identity pinning for the hardcoded trusted core.
//!
//! Every hardcoded node is pinned to an ML-DSA-65 public key at compile time.
//! Bootstrap and peer-selection code use this table to decide whether an
//! address belongs to the trusted core, and to authenticate its
//! challenge-response handshake (see `net::verification`).
//!
//! The addresses here overlap with `dns::get_all_hardcoded_addrs_*`, but the
//! two tables serve different purposes: `dns` resolves reachable addresses,
//! this module pins identity (public key) to a subset of them.

use crate::crypto::{verify_mldsa65, MlDsa65PublicKey, MLDSA65_PUBKEY_SIZE};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

use super::types::DEFAULT_PORT;

/// 32 bytes of server-chosen entropy a hardcoded node must sign to prove identity.
pub const CHALLENGE_SIZE: usize = 32;
pub type Challenge = [u8; CHALLENGE_SIZE];

#[derive(Error, Debug)]
pub enum HardcodedAuthError {
    #[error("address is not a known hardcoded node")]
    UnknownAddress,
    #[error("signature verification failed")]
    BadSignature,
}

/// A single pinned trusted-core node.
#[derive(Debug, Clone)]
pub struct HardcodedNode {
    pub addr: SocketAddr,
    pub pubkey: MlDsa65PublicKey,
    /// Human label, for logs only (jurisdiction/operator).
    pub label: &'static str,
}

/// Mainnet trusted core.
///
/// SECURITY: these public keys are compiled into the binary. An attacker who
/// controls fewer than `MIN_HARDCODED_RESPONSE_PERCENT` of this list cannot
/// forge a response (see `net::bootstrap`). Keys below are placeholders —
/// operators of real hardcoded nodes must replace them with the output of
/// `montana keygen` before a mainnet launch.
pub const MAINNET_HARDCODED: &[HardcodedNode] = &[
    HardcodedNode {
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(176, 124, 208, 93)), DEFAULT_PORT),
        pubkey: [0u8; MLDSA65_PUBKEY_SIZE],
        label: "timeweb-primary",
    },
];

/// Testnet trusted core (separate keys, never reused on mainnet).
pub const TESTNET_HARDCODED: &[HardcodedNode] = &[
    HardcodedNode {
        addr: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(176, 124, 208, 93)),
            DEFAULT_PORT + 1,
        ),
        pubkey: [0u8; MLDSA65_PUBKEY_SIZE],
        label: "timeweb-testnet",
    },
];

fn table(testnet: bool) -> &'static [HardcodedNode] {
    if testnet {
        TESTNET_HARDCODED
    } else {
        MAINNET_HARDCODED
    }
}

/// All hardcoded node addresses for the given network.
pub fn get_hardcoded_addrs(testnet: bool) -> Vec<SocketAddr> {
    table(testnet).iter().map(|n| n.addr).collect()
}

/// All hardcoded node records for the given network.
pub fn get_hardcoded_nodes(testnet: bool) -> &'static [HardcodedNode] {
    table(testnet)
}

/// True if `addr` is a pinned hardcoded node on this network.
pub fn is_hardcoded_addr(addr: &SocketAddr, testnet: bool) -> bool {
    table(testnet).iter().any(|n| &n.addr == addr)
}

/// Look up the pinned public key for a hardcoded address.
pub fn get_hardcoded_pubkey(addr: &SocketAddr, testnet: bool) -> Option<&'static MlDsa65PublicKey> {
    table(testnet).iter().find(|n| &n.addr == addr).map(|n| &n.pubkey)
}

/// Verify a hardcoded node's challenge-response.
///
/// The node must have signed `challenge` with the secret key matching its
/// pinned public key.
pub fn verify_hardcoded_response(
    addr: &SocketAddr,
    challenge: &Challenge,
    signature: &[u8],
    testnet: bool,
) -> Result<(), HardcodedAuthError> {
    let pubkey = get_hardcoded_pubkey(addr, testnet).ok_or(HardcodedAuthError::UnknownAddress)?;
    if verify_mldsa65(pubkey, challenge, signature) {
        Ok(())
    } else {
        Err(HardcodedAuthError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_and_testnet_tables_are_disjoint() {
        let main: std::collections::HashSet<_> = get_hardcoded_addrs(false).into_iter().collect();
        let test: std::collections::HashSet<_> = get_hardcoded_addrs(true).into_iter().collect();
        assert!(main.is_disjoint(&test));
    }

    #[test]
    fn unknown_address_is_rejected() {
        let addr: SocketAddr = "1.2.3.4:9".parse().unwrap();
        assert!(!is_hardcoded_addr(&addr, false));
        assert!(get_hardcoded_pubkey(&addr, false).is_none());
        assert!(matches!(
            verify_hardcoded_response(&addr, &[0u8; CHALLENGE_SIZE], &[], false),
            Err(HardcodedAuthError::UnknownAddress)
        ));
    }
}
