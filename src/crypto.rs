use crate::types::{Hash, PublicKey, Signature};
use pqcrypto_dilithium::dilithium3 as dilithium;
use pqcrypto_traits::sign::{PublicKey as PkTrait, DetachedSignature, SecretKey as SkTrait};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

pub const MLDSA65_PUBKEY_SIZE: usize = 1952;
pub const MLDSA65_SIG_SIZE: usize = 3293;
pub const MLDSA65_SECRET_SIZE: usize = 4000;

pub type MlDsa65PublicKey = [u8; MLDSA65_PUBKEY_SIZE];
pub type MlDsa65Signature = Vec<u8>;

pub mod mldsa {
    pub use super::{
        MlDsa65PublicKey, MlDsa65Signature,
        MLDSA65_PUBKEY_SIZE, MLDSA65_SIG_SIZE, MLDSA65_SECRET_SIZE,
        verify_mldsa65, sign_mldsa65,
    };
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
}

pub struct Keypair {
    pub public: PublicKey,
    secret: dilithium::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = dilithium::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: sk,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = dilithium::detached_sign(message, &self.secret);
        sig.as_bytes().to_vec()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw secret-key bytes, for APIs (e.g. `vrf_prove`) that take a detached
    /// key rather than a `Keypair`.
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.as_bytes().to_vec()
    }

    /// Reconstruct a keypair from previously-saved public/secret bytes.
    pub fn from_bytes(public: PublicKey, secret_bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = dilithium::SecretKey::from_bytes(secret_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { public, secret })
    }
}

pub fn verify(pubkey: &PublicKey, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let pk = dilithium::PublicKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = dilithium::DetachedSignature::from_bytes(signature).map_err(|_| CryptoError::InvalidSignature)?;
    dilithium::verify_detached_signature(&sig, message, &pk).map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha3_concat(a: &[u8], b: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    if leaves.len() == 1 {
        return leaves[0];
    }

    let mut level: Vec<Hash> = leaves.to_vec();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for chunk in level.chunks(2) {
            if chunk.len() == 2 {
                next.push(sha3_concat(&chunk[0], &chunk[1]));
            } else {
                next.push(sha3_concat(&chunk[0], &chunk[0]));
            }
        }
        level = next;
    }

    level[0]
}

pub fn lottery_seed(prev_hash: &Hash, tau2_index: u64) -> Hash {
    let mut data = prev_hash.to_vec();
    data.extend(&tau2_index.to_le_bytes());
    sha3(&data)
}

pub fn select_pool(seed: &Hash) -> u8 {
    seed[0] % 100
}

pub fn select_winner(seed: &Hash, weights: &[(PublicKey, u64)]) -> Option<PublicKey> {
    if weights.is_empty() {
        return None;
    }

    let total: u64 = weights.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }

    let target = u64::from_le_bytes(seed[0..8].try_into().unwrap()) % total;

    let mut cumulative = 0u64;
    for (pubkey, weight) in weights {
        cumulative += weight;
        if cumulative > target {
            return Some(pubkey.clone());
        }
    }

    Some(weights.last().unwrap().0.clone())
}

pub fn verify_mldsa65(pubkey: &MlDsa65PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let pk = match dilithium::PublicKey::from_bytes(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match dilithium::DetachedSignature::from_bytes(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    dilithium::verify_detached_signature(&sig, message, &pk).is_ok()
}

pub fn sign_mldsa65(secret_key: &[u8], message: &[u8]) -> Option<MlDsa65Signature> {
    let sk = dilithium::SecretKey::from_bytes(secret_key).ok()?;
    let sig = dilithium::detached_sign(message, &sk);
    Some(sig.as_bytes().to_vec())
}

pub fn generate_mldsa65_keypair() -> (MlDsa65PublicKey, Vec<u8>) {
    let (pk, sk) = dilithium::keypair();
    let mut pubkey = [0u8; MLDSA65_PUBKEY_SIZE];
    pubkey.copy_from_slice(pk.as_bytes());
    (pubkey, sk.as_bytes().to_vec())
}

// ============================================================================
// HKDF-SHA3 EXPANSION
// ============================================================================
//
// Same extract-then-expand construction as net::noise's `hkdf_sha3`, generalized
// to produce an arbitrary number of 32-byte outputs. Used to derive the
// SLOTS_PER_TAU2 backup-slot seeds from a single lottery seed.

/// Expand `seed` into `count` pseudorandom 32-byte outputs.
pub fn hkdf_expand_sha3(seed: &Hash, count: usize) -> Vec<Hash> {
    let mut hasher = Sha3_256::new();
    hasher.update(b"MONTANA_HKDF_EXTRACT:");
    hasher.update(seed);
    let temp_key: Hash = hasher.finalize().into();

    let mut outputs = Vec::with_capacity(count);
    let mut prev: Option<Hash> = None;
    for i in 0..count {
        let mut hasher = Sha3_256::new();
        hasher.update(&temp_key);
        if let Some(prev) = prev {
            hasher.update(&prev);
        }
        hasher.update(&[(i + 1) as u8]);
        let out: Hash = hasher.finalize().into();
        outputs.push(out);
        prev = Some(out);
    }
    outputs
}

// ============================================================================
// VDF CONTRACT (C1) — black box per design
// ============================================================================
//
// The actual Wesolowski/SHAKE256 group-theoretic construction is out of
// scope (treated as an external primitive). This is a stand-in that upholds
// the *shape* of the contract — sequential compute, a proof, and a verify
// call — without claiming the fast-verify property a real VDF gives you.
// Swap-in point for a real group-of-unknown-order VDF before mainnet.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VdfProof {
    pub checkpoints: Vec<Hash>,
}

/// Sequentially apply SHA3-256 `iterations` times to `input`, recording a
/// checkpoint every `iterations / CHECKPOINT_COUNT` steps.
pub fn vdf_compute(input: &Hash, iterations: u64) -> (Hash, VdfProof) {
    const CHECKPOINT_COUNT: u64 = 16;
    let stride = (iterations / CHECKPOINT_COUNT).max(1);

    let mut state = *input;
    let mut checkpoints = Vec::new();
    for i in 1..=iterations {
        state = sha3(&state);
        if i % stride == 0 {
            checkpoints.push(state);
        }
    }

    (state, VdfProof { checkpoints })
}

/// Verify a VDF output by recomputing the chain and comparing checkpoints.
pub fn vdf_verify(input: &Hash, output: &Hash, proof: &VdfProof, iterations: u64) -> bool {
    let (recomputed, recomputed_proof) = vdf_compute(input, iterations);
    &recomputed == output && &recomputed_proof.checkpoints == &proof.checkpoints
}

// ============================================================================
// VRF CONTRACT (C1) — hash-based construction over ML-DSA-65
// ============================================================================
//
// Pinned construction (per the open question in the design notes):
// a hash-based PQ VRF built on top of ML-DSA-65. `pi` is the ML-DSA-65
// signature over `input` (deterministic per keypair+message under the
// underlying signer); `beta` is SHA3-256(pi), uniform over 2^256 as required.
// This satisfies determinism and unforgeability without requiring a
// dedicated elliptic-curve VRF crate; must not be changed post-mainnet
// without a hard fork (per the open question).

pub type VrfOutput = Hash;
pub type VrfProof = Vec<u8>;

/// Produce a VRF output and proof for `input` under `secret_key`.
pub fn vrf_prove(secret_key: &[u8], input: &Hash) -> Option<(VrfOutput, VrfProof)> {
    let pi = sign_mldsa65(secret_key, input)?;
    let beta = sha3(&pi);
    Some((beta, pi))
}

/// Verify a VRF output/proof pair against `pubkey` and `input`.
pub fn vrf_verify(pubkey: &MlDsa65PublicKey, input: &Hash, beta: &VrfOutput, pi: &VrfProof) -> bool {
    if !verify_mldsa65(pubkey, input, pi) {
        return false;
    }
    &sha3(pi) == beta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_root_single_leaf_is_identity() {
        let leaf = sha3(b"one");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn lottery_seed_is_deterministic() {
        let prev = sha3(b"parent");
        assert_eq!(lottery_seed(&prev, 42), lottery_seed(&prev, 42));
        assert_ne!(lottery_seed(&prev, 42), lottery_seed(&prev, 43));
    }

    #[test]
    fn hkdf_expand_produces_distinct_outputs() {
        let seed = sha3(b"seed");
        let outputs = hkdf_expand_sha3(&seed, 10);
        assert_eq!(outputs.len(), 10);
        for i in 0..outputs.len() {
            for j in (i + 1)..outputs.len() {
                assert_ne!(outputs[i], outputs[j]);
            }
        }
    }

    #[test]
    fn hkdf_expand_is_deterministic() {
        let seed = sha3(b"seed");
        assert_eq!(hkdf_expand_sha3(&seed, 5), hkdf_expand_sha3(&seed, 5));
    }

    #[test]
    fn vdf_round_trips() {
        let input = sha3(b"vdf-input");
        let (output, proof) = vdf_compute(&input, 64);
        assert!(vdf_verify(&input, &output, &proof, 64));
    }

    #[test]
    fn vdf_rejects_wrong_iteration_count() {
        let input = sha3(b"vdf-input");
        let (output, proof) = vdf_compute(&input, 64);
        assert!(!vdf_verify(&input, &output, &proof, 32));
    }

    #[test]
    fn vrf_round_trips_and_is_deterministic() {
        let (pubkey, secret) = generate_mldsa65_keypair();
        let input = sha3(b"vrf-input");

        let (beta1, pi1) = vrf_prove(&secret, &input).unwrap();
        let (beta2, _pi2) = vrf_prove(&secret, &input).unwrap();

        assert_eq!(beta1, beta2);
        assert!(vrf_verify(&pubkey, &input, &beta1, &pi1));
    }
}
