//! Montana consensus layer — tiered presence evidence, the lottery, and the
//! slice-level checks that feed fork choice.
//!
//! # Tiers
//!
//! Participants fall into three tiers (`types::NodeType`), each with a fixed
//! lottery share: Full Node 70%, Verified User 20%, Light Client 10%.
//!
//! - **Full Node** — automatic presence signature every τ₁ (1 minute). No
//!   biometrics; runs unattended.
//! - **Verified User** — mobile wallet, signs on a randomized 10-40 minute
//!   interval with hardware-biometric FIDO2/WebAuthn attestation.
//! - **Light Client** — lightest-weight participant; evidence format beyond
//!   a basic presence proof is left to a higher layer.
//!
//! # Security properties
//!
//! 1. Sybil resistance: biometrics + secure element ⇒ one person, one vote.
//! 2. Bot resistance: unpredictable verification interval + 30s window.
//! 3. Impersonation resistance: FIDO2 device binding.
//! 4. Emulation resistance: hardware attestation from the secure enclave.

use crate::crypto::{self, hkdf_expand_sha3};
use crate::types::{
    self, Hash, NodeType, PublicKey, Signature, FULL_NODE_CHANCE, LIGHT_CLIENT_CHANCE,
    LIGHT_NODE_CHANCE,
};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Grace period at end of τ₂ — no new presence submissions accepted.
pub const GRACE_PERIOD_SECS: u64 = types::GRACE_PERIOD_SECS;

/// Number of slots per τ₂: one primary + nine HKDF-derived backups.
pub const SLOTS_PER_TAU2: u64 = 10;

/// Nominal duration of each slot (also τ₁).
pub const SLOT_DURATION_SECS: u64 = 60;

/// τ₁ — Full Node presence interval.
pub const TAU1_SECS: u64 = types::TAU1_MINUTES * 60;

/// τ₂ — slice interval.
pub const TAU2_SECS: u64 = types::TAU2_MINUTES * 60;

/// Verified User minimum verification interval (10 minutes).
pub const VERIFIED_USER_MIN_INTERVAL_SECS: u64 = 10 * 60;

/// Verified User maximum verification interval (40 minutes).
pub const VERIFIED_USER_MAX_INTERVAL_SECS: u64 = 40 * 60;

/// Verified User verification window.
pub const VERIFICATION_WINDOW_SECS: u64 = 30;

/// Lottery share, Full Node tier (TIER-1).
pub const FULL_NODE_CAP_PERCENT: u64 = FULL_NODE_CHANCE as u64;
/// Lottery share, Verified User tier (TIER-2). Kept under its historical
/// "light node" name for continuity with the rest of the codebase.
pub const LIGHT_NODE_CAP_PERCENT: u64 = LIGHT_NODE_CHANCE as u64;
/// Lottery share, Light Client tier (TIER-3).
pub const LIGHT_CLIENT_CAP_PERCENT: u64 = LIGHT_CLIENT_CHANCE as u64;

/// Fixed-point precision used when a weight in `[0,1]` needs to cross the
/// wire or go into storage as an integer.
pub const LOTTERY_PRECISION: u64 = 1_000_000;

/// Maximum candidates in a single lottery (prevents OOM).
pub const MAX_LOTTERY_PARTICIPANTS: usize = 10_000;

/// Maximum presences per slice (prevents OOM).
pub const MAX_PRESENCES_PER_SLICE: usize = 5_000;

/// Minimum days of presence history required before τ₃ tier promotion.
pub const TAU3_MIN_DAYS: u64 = 14;

/// Success rate required over that window (90%).
pub const TAU3_SUCCESS_RATE: f64 = 0.90;

/// Convert a `[0,1]` weight to its fixed-point integer representation.
pub fn to_fixed_point(weight: f64) -> u64 {
    (weight.clamp(0.0, 1.0) * LOTTERY_PRECISION as f64).round() as u64
}

/// Convert a fixed-point integer weight back to `[0,1]`.
pub fn from_fixed_point(value: u64) -> f64 {
    (value as f64 / LOTTERY_PRECISION as f64).clamp(0.0, 1.0)
}

// ============================================================================
// PRESENCE EVIDENCE
// ============================================================================

/// Presence evidence from a Full Node: an automatic τ₁ signature, no human
/// interaction required.
#[derive(Debug, Clone)]
pub struct FullNodePresence {
    pub timestamp: u64,
    pub prev_slice_hash: Hash,
    pub pubkey: PublicKey,
    pub signature: Signature,
    pub tau2_index: u64,
}

impl FullNodePresence {
    pub fn new(prev_slice_hash: Hash, keypair: &impl Signer) -> Self {
        let timestamp = now();
        let tau2_index = timestamp / TAU2_SECS;
        let pubkey = keypair.public_key();
        let message = Self::message_to_sign(timestamp, &prev_slice_hash, &pubkey, tau2_index);
        let signature = keypair.sign(&message);

        Self { timestamp, prev_slice_hash, pubkey, signature, tau2_index }
    }

    fn message_to_sign(timestamp: u64, prev_slice_hash: &Hash, pubkey: &PublicKey, tau2_index: u64) -> Vec<u8> {
        let mut msg = Vec::with_capacity(32 + pubkey.len() + 32);
        msg.extend_from_slice(b"MONTANA_PRESENCE_V1:");
        msg.extend_from_slice(&timestamp.to_le_bytes());
        msg.extend_from_slice(prev_slice_hash);
        msg.extend_from_slice(pubkey);
        msg.extend_from_slice(&tau2_index.to_le_bytes());
        msg
    }

    pub fn verify(&self) -> Result<(), PresenceError> {
        let now = now();

        if self.timestamp > now + 10 {
            return Err(PresenceError::FutureTimestamp);
        }
        if self.timestamp < now.saturating_sub(TAU2_SECS * 2) {
            return Err(PresenceError::ExpiredTimestamp);
        }

        let message = Self::message_to_sign(self.timestamp, &self.prev_slice_hash, &self.pubkey, self.tau2_index);
        crypto::verify(&self.pubkey, &message, &self.signature).map_err(|_| PresenceError::InvalidSignature)
    }

    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(32 + self.pubkey.len() + self.signature.len());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.prev_slice_hash);
        buf.extend_from_slice(&self.pubkey);
        buf.extend_from_slice(&self.signature);
        crypto::sha3(&buf)
    }
}

/// Presence evidence from a Verified User (mobile wallet). Requires the app
/// in the foreground, an active screen, hardware biometrics, and a valid
/// FIDO2/WebAuthn attestation.
#[derive(Debug, Clone)]
pub struct VerifiedUserPresence {
    pub timestamp: u64,
    pub prev_slice_hash: Hash,
    pub pubkey: PublicKey,
    /// Accumulated consecutive τ₂ periods of presence (1-4).
    pub accumulated_tau2: u8,
    /// Liveness attestation from the secure enclave.
    pub liveness_attestation: Vec<u8>,
    pub device_attestation: Fido2Attestation,
    pub signature: Signature,
    pub tau2_index: u64,
}

/// FIDO2/WebAuthn attestation data. Whether the full blob or only its hash
/// belongs on-chain is left to a higher specification layer — the wire type
/// just needs to carry whichever the caller chooses to attach.
#[derive(Debug, Clone)]
pub struct Fido2Attestation {
    pub auth_data: Vec<u8>,
    pub client_data_hash: Hash,
    pub signature: Vec<u8>,
    pub certificates: Vec<Vec<u8>>,
    pub format: AttestationFormat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttestationFormat {
    Packed,
    AndroidKey,
    Apple,
    SamsungKnox,
    HuaweiHms,
    Tpm,
    /// No attestation — only permitted in tests.
    None,
}

impl VerifiedUserPresence {
    /// Next verification interval: `10 + (seed mod 31)` minutes, unpredictable.
    pub fn next_interval(prev_slice_hash: &Hash, device_pubkey: &PublicKey, last_check_tau2: u64) -> u64 {
        let mut buf = Vec::with_capacity(32 + device_pubkey.len() + 8);
        buf.extend_from_slice(prev_slice_hash);
        buf.extend_from_slice(device_pubkey);
        buf.extend_from_slice(&last_check_tau2.to_le_bytes());
        let seed = crypto::sha3(&buf);

        let seed_val = u64::from_le_bytes(seed[..8].try_into().unwrap());
        let minutes = 10 + (seed_val % 31);
        minutes * 60
    }

    pub fn verify(&self) -> Result<(), PresenceError> {
        let now = now();

        if self.timestamp > now + 10 {
            return Err(PresenceError::FutureTimestamp);
        }
        if self.accumulated_tau2 == 0 || self.accumulated_tau2 > 4 {
            return Err(PresenceError::InvalidAccumulatedTau2);
        }

        self.verify_fido2_attestation()?;
        self.verify_liveness_attestation()?;

        let message = self.message_to_sign();
        crypto::verify(&self.pubkey, &message, &self.signature).map_err(|_| PresenceError::InvalidSignature)
    }

    fn message_to_sign(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(64 + self.pubkey.len() + self.liveness_attestation.len());
        msg.extend_from_slice(b"MONTANA_VERIFIED_USER_V1:");
        msg.extend_from_slice(&self.timestamp.to_le_bytes());
        msg.extend_from_slice(&self.prev_slice_hash);
        msg.extend_from_slice(&self.pubkey);
        msg.push(self.accumulated_tau2);
        msg.extend_from_slice(&self.liveness_attestation);
        msg.extend_from_slice(&self.device_attestation.auth_data);
        msg.extend_from_slice(&self.tau2_index.to_le_bytes());
        msg
    }

    fn verify_fido2_attestation(&self) -> Result<(), PresenceError> {
        let att = &self.device_attestation;

        // rpIdHash (32) + flags (1) + counter (4)
        if att.auth_data.len() < 37 {
            return Err(PresenceError::InvalidFido2AuthData);
        }

        let flags = att.auth_data[32];
        if flags & 0x01 == 0 {
            return Err(PresenceError::Fido2UserNotPresent);
        }
        if flags & 0x04 == 0 {
            return Err(PresenceError::Fido2UserNotVerified);
        }

        match att.format {
            AttestationFormat::None => {
                #[cfg(not(test))]
                return Err(PresenceError::NoAttestation);
            }
            AttestationFormat::Packed | AttestationFormat::AndroidKey | AttestationFormat::Apple => {
                if att.signature.is_empty() {
                    return Err(PresenceError::InvalidFido2Signature);
                }
            }
            AttestationFormat::SamsungKnox | AttestationFormat::HuaweiHms | AttestationFormat::Tpm => {
                if att.certificates.is_empty() {
                    return Err(PresenceError::MissingAttestationCert);
                }
            }
        }

        Ok(())
    }

    fn verify_liveness_attestation(&self) -> Result<(), PresenceError> {
        if self.liveness_attestation.len() < 64 {
            return Err(PresenceError::InvalidLivenessAttestation);
        }
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.prev_slice_hash);
        buf.extend_from_slice(&self.pubkey);
        buf.push(self.accumulated_tau2);
        buf.extend_from_slice(&self.liveness_attestation);
        buf.extend_from_slice(&self.device_attestation.auth_data);
        buf.extend_from_slice(&self.signature);
        crypto::sha3(&buf)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceError {
    FutureTimestamp,
    ExpiredTimestamp,
    InvalidSignature,
    InvalidAccumulatedTau2,
    InvalidFido2AuthData,
    Fido2UserNotPresent,
    Fido2UserNotVerified,
    InvalidFido2Signature,
    NoAttestation,
    MissingAttestationCert,
    InvalidLivenessAttestation,
    InGracePeriod,
    NotEligible,
}

// ============================================================================
// LOTTERY
// ============================================================================

/// A node eligible to enter the lottery for this τ₂.
#[derive(Debug, Clone)]
pub struct LotteryCandidate {
    pub pubkey: PublicKey,
    pub node_type: NodeType,
    /// Aggregate node weight in `[0,1]`, post cluster-penalty/entropy-decay
    /// (see `weight::WeightDimensions`).
    pub weight: f64,
    /// τ₂ index until which this candidate is excluded (cooldown or
    /// equivocation quarantine); 0 if none.
    pub cooldown_until: u64,
}

/// A single slot's winner.
#[derive(Debug, Clone, PartialEq)]
pub struct LotteryWinner {
    pub pubkey: PublicKey,
    pub node_type: NodeType,
    pub slot: u32,
}

/// Lottery outcome for one τ₂. `winners` is ordered by slot; a slot is
/// absent entirely if no tier had a viable candidate for it.
#[derive(Debug, Clone)]
pub struct LotteryResult {
    pub tau2_index: u64,
    pub seed: Hash,
    pub winners: Vec<LotteryWinner>,
}

impl LotteryResult {
    pub fn winner_for_slot(&self, slot: u32) -> Option<&LotteryWinner> {
        self.winners.iter().find(|w| w.slot == slot)
    }

    pub fn primary(&self) -> Option<&LotteryWinner> {
        self.winner_for_slot(0)
    }
}

/// Deterministic, bounded lottery for one τ₂ period.
#[derive(Debug)]
pub struct Lottery {
    candidates: Vec<LotteryCandidate>,
    prev_slice_hash: Hash,
    tau2_index: u64,
}

impl Lottery {
    pub fn new(prev_slice_hash: Hash, tau2_index: u64) -> Self {
        Self { candidates: Vec::new(), prev_slice_hash, tau2_index }
    }

    pub fn add_candidate(&mut self, candidate: LotteryCandidate) -> bool {
        if self.candidates.len() >= MAX_LOTTERY_PARTICIPANTS {
            return false;
        }
        self.candidates.push(candidate);
        true
    }

    /// `seed = SHA3(prev_slice_hash ‖ τ₂_index)` — deterministic, pre-block.
    /// Never fold in anything the producer controls (e.g. the presence root).
    pub fn seed(&self) -> Hash {
        crypto::lottery_seed(&self.prev_slice_hash, self.tau2_index)
    }

    fn eligible(&self) -> Vec<&LotteryCandidate> {
        self.candidates.iter().filter(|c| c.cooldown_until <= self.tau2_index).collect()
    }

    /// Tier selection from the first 8 bytes of `slot_seed` as `u64 / 2^64`,
    /// against cumulative 0.70 / 0.20 / 0.10 thresholds, falling through in
    /// priority order (Full → Light → Client → wrap) when the chosen tier
    /// has no eligible candidate.
    fn resolve_tier(slot_seed: &Hash, has_full: bool, has_light: bool, has_client: bool) -> Option<NodeType> {
        let draw = u64::from_le_bytes(slot_seed[0..8].try_into().unwrap()) as f64 / u64::MAX as f64;

        let order = [
            (NodeType::Full, FULL_NODE_CAP_PERCENT as f64 / 100.0, has_full),
            (NodeType::Light, LIGHT_NODE_CAP_PERCENT as f64 / 100.0, has_light),
            (NodeType::Client, LIGHT_CLIENT_CAP_PERCENT as f64 / 100.0, has_client),
        ];

        let mut cumulative = 0.0;
        let mut chosen = order.len() - 1;
        for (i, (_, share, _)) in order.iter().enumerate() {
            cumulative += share;
            if draw < cumulative {
                chosen = i;
                break;
            }
        }

        (chosen..order.len())
            .chain(0..chosen)
            .find(|&i| order[i].2)
            .map(|i| order[i].0)
    }

    /// Weighted selection within a tier: pick the candidate (in canonical
    /// pubkey order) for which `H(seed ∥ pubkey) / 2^256 < w_i / Σw`. If no
    /// candidate's draw clears its own threshold, fall back to the one with
    /// the smallest draw — keeps selection total without weakening the
    /// weighting in the common case.
    fn select_within_tier(candidates: &[&LotteryCandidate], slot_seed: &Hash) -> Option<PublicKey> {
        if candidates.is_empty() {
            return None;
        }
        let total_weight: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
        if total_weight <= 0.0 {
            return None;
        }

        let mut ordered: Vec<&&LotteryCandidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        let mut fallback: Option<(PublicKey, f64)> = None;
        for candidate in ordered {
            let h = crypto::sha3_concat(slot_seed, &candidate.pubkey);
            let draw = u64::from_le_bytes(h[0..8].try_into().unwrap()) as f64 / u64::MAX as f64;
            let threshold = candidate.weight.max(0.0) / total_weight;

            if draw < threshold {
                return Some(candidate.pubkey.clone());
            }
            if fallback.as_ref().is_none_or(|(_, best)| draw < *best) {
                fallback = Some((candidate.pubkey.clone(), draw));
            }
        }
        fallback.map(|(pk, _)| pk)
    }

    /// Run the lottery: one seed, expanded via HKDF-SHA3 into
    /// `SLOTS_PER_TAU2` per-slot sub-seeds, each independently resolved to a
    /// tier then a winner within that tier.
    pub fn run(&self) -> LotteryResult {
        let seed = self.seed();
        let eligible = self.eligible();

        let has_full = eligible.iter().any(|c| c.node_type == NodeType::Full);
        let has_light = eligible.iter().any(|c| c.node_type == NodeType::Light);
        let has_client = eligible.iter().any(|c| c.node_type == NodeType::Client);

        let slot_seeds = hkdf_expand_sha3(&seed, SLOTS_PER_TAU2 as usize);
        let mut winners = Vec::new();

        for (slot, slot_seed) in slot_seeds.iter().enumerate() {
            let Some(tier) = Self::resolve_tier(slot_seed, has_full, has_light, has_client) else {
                continue;
            };
            let tier_candidates: Vec<&LotteryCandidate> =
                eligible.iter().copied().filter(|c| c.node_type == tier).collect();

            if let Some(pubkey) = Self::select_within_tier(&tier_candidates, slot_seed) {
                winners.push(LotteryWinner { pubkey, node_type: tier, slot: slot as u32 });
            }
        }

        LotteryResult { tau2_index: self.tau2_index, seed, winners }
    }

    pub fn verify_winner(result: &LotteryResult, pubkey: &PublicKey, slot: u32) -> bool {
        result.winner_for_slot(slot).is_some_and(|w| &w.pubkey == pubkey)
    }
}

// ============================================================================
// SLICE VALIDATION
// ============================================================================

/// Errors in the presence/producer portion of slice validation. This covers
/// only the lottery- and presence-level checks; cumulative-weight, VDF/VRF
/// and cooldown-median checks are composed on top by the engine, which has
/// access to storage and the running weight model.
#[derive(Debug, Clone)]
pub enum SliceError {
    TooManyPresences,
    InvalidProducer,
    PresenceRootMismatch,
    PresenceError(PresenceError),
    InvalidProducerSignature,
}

/// Verify that `slice` was produced by the rightful lottery winner for
/// `slot`, that its presence root matches its contents, and that every
/// included presence and the producer signature itself verify.
pub fn verify_slice(
    slice: &types::Slice,
    lottery_result: &LotteryResult,
    slot: u32,
) -> Result<(), SliceError> {
    if slice.presences.len() > MAX_PRESENCES_PER_SLICE {
        return Err(SliceError::TooManyPresences);
    }

    if !Lottery::verify_winner(lottery_result, &slice.header.winner_pubkey, slot) {
        return Err(SliceError::InvalidProducer);
    }

    let leaves: Vec<Hash> = slice.presences.iter().map(|p| p.hash()).collect();
    let computed_root = crate::merkle::MerkleTree::new(leaves).root();
    if computed_root != slice.presence_root {
        return Err(SliceError::PresenceRootMismatch);
    }

    for presence in &slice.presences {
        crypto::verify(&presence.pubkey, &presence_message(presence), &presence.signature)
            .map_err(|_| SliceError::PresenceError(PresenceError::InvalidSignature))?;
    }

    let header_hash = slice.header.hash();
    crypto::verify(&slice.header.winner_pubkey, &header_hash, &slice.signature)
        .map_err(|_| SliceError::InvalidProducerSignature)
}

pub(crate) fn presence_message(presence: &types::PresenceProof) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64 + presence.pubkey.len());
    msg.extend_from_slice(b"MONTANA_PRESENCE_PROOF_V1:");
    msg.extend_from_slice(&presence.pubkey);
    msg.extend_from_slice(&presence.tau2_index.to_le_bytes());
    msg.extend_from_slice(&presence.tau1_bitmap.to_le_bytes());
    msg.extend_from_slice(&presence.prev_slice_hash);
    msg.extend_from_slice(&presence.timestamp.to_le_bytes());
    msg
}

// ============================================================================
// TRAITS FOR CRYPTO ABSTRACTION
// ============================================================================

pub trait Signer {
    fn sign(&self, message: &[u8]) -> Signature;
    fn public_key(&self) -> PublicKey;
}

impl Signer for crate::crypto::Keypair {
    fn sign(&self, message: &[u8]) -> Signature {
        crate::crypto::Keypair::sign(self, message)
    }

    fn public_key(&self) -> PublicKey {
        crate::crypto::Keypair::public_key(self).clone()
    }
}

// ============================================================================
// GRACE PERIOD
// ============================================================================

/// True during the last `GRACE_PERIOD_SECS` of τ₂: no new presence
/// submissions are accepted, giving the network time to settle before the
/// lottery runs.
pub fn in_grace_period() -> bool {
    let time_in_tau2 = now() % TAU2_SECS;
    time_in_tau2 >= (TAU2_SECS - GRACE_PERIOD_SECS)
}

pub fn seconds_until_tau2() -> u64 {
    TAU2_SECS - (now() % TAU2_SECS)
}

pub fn current_tau2_index() -> u64 {
    now() / TAU2_SECS
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey(byte: u8) -> PublicKey {
        vec![byte; 1952]
    }

    #[test]
    fn test_constants() {
        assert_eq!(GRACE_PERIOD_SECS, 30);
        assert_eq!(SLOTS_PER_TAU2, 10);
        assert_eq!(TAU1_SECS, 60);
        assert_eq!(TAU2_SECS, 600);
        assert_eq!(FULL_NODE_CAP_PERCENT + LIGHT_NODE_CAP_PERCENT + LIGHT_CLIENT_CAP_PERCENT, 100);
    }

    #[test]
    fn fixed_point_round_trips() {
        assert_eq!(from_fixed_point(to_fixed_point(0.7)), 0.7);
        assert_eq!(to_fixed_point(1.5), LOTTERY_PRECISION); // clamped
        assert_eq!(to_fixed_point(-1.0), 0);
    }

    #[test]
    fn lottery_seed_is_deterministic_and_input_sensitive() {
        let lottery1 = Lottery::new([1u8; 32], 100);
        let lottery2 = Lottery::new([1u8; 32], 100);
        let lottery3 = Lottery::new([2u8; 32], 100);

        assert_eq!(lottery1.seed(), lottery2.seed());
        assert_ne!(lottery1.seed(), lottery3.seed());
    }

    #[test]
    fn lottery_with_only_full_nodes_always_selects_full_tier() {
        let mut lottery = Lottery::new([0u8; 32], 1);
        for i in 0..5u8 {
            lottery.add_candidate(LotteryCandidate {
                pubkey: pubkey(i),
                node_type: NodeType::Full,
                weight: 0.5,
                cooldown_until: 0,
            });
        }

        let result = lottery.run();
        assert_eq!(result.winners.len(), SLOTS_PER_TAU2 as usize);
        assert!(result.winners.iter().all(|w| w.node_type == NodeType::Full));
    }

    #[test]
    fn lottery_skips_candidates_still_in_cooldown() {
        let mut lottery = Lottery::new([0u8; 32], 100);
        lottery.add_candidate(LotteryCandidate {
            pubkey: pubkey(1),
            node_type: NodeType::Full,
            weight: 1.0,
            cooldown_until: 200, // still cooling down at tau2=100
        });

        let result = lottery.run();
        assert!(result.winners.is_empty());
    }

    #[test]
    fn lottery_is_deterministic_across_independent_runs() {
        let build = || {
            let mut lottery = Lottery::new([0xBEu8; 32], 42);
            lottery.add_candidate(LotteryCandidate {
                pubkey: pubkey(1),
                node_type: NodeType::Full,
                weight: 0.7,
                cooldown_until: 0,
            });
            lottery.add_candidate(LotteryCandidate {
                pubkey: pubkey(2),
                node_type: NodeType::Light,
                weight: 0.2,
                cooldown_until: 0,
            });
            lottery.add_candidate(LotteryCandidate {
                pubkey: pubkey(3),
                node_type: NodeType::Client,
                weight: 0.1,
                cooldown_until: 0,
            });
            lottery.run()
        };

        let result1 = build();
        let result2 = build();

        assert_eq!(result1.primary().cloned(), result2.primary().cloned());
        assert_eq!(
            result1.winners.iter().map(|w| w.pubkey.clone()).collect::<Vec<_>>(),
            result2.winners.iter().map(|w| w.pubkey.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_verified_user_interval() {
        let prev_hash = [1u8; 32];
        let device_pubkey = pubkey(2);
        let secs = VerifiedUserPresence::next_interval(&prev_hash, &device_pubkey, 100);
        assert!(secs >= VERIFIED_USER_MIN_INTERVAL_SECS);
        assert!(secs <= VERIFIED_USER_MAX_INTERVAL_SECS);
    }

    #[test]
    fn test_verified_user_interval_deterministic() {
        let prev_hash = [1u8; 32];
        let device_pubkey = pubkey(2);
        let a = VerifiedUserPresence::next_interval(&prev_hash, &device_pubkey, 100);
        let b = VerifiedUserPresence::next_interval(&prev_hash, &device_pubkey, 100);
        assert_eq!(a, b);
    }

    #[test]
    fn full_node_presence_round_trips_through_a_real_keypair() {
        let keypair = crate::crypto::Keypair::generate();
        let presence = FullNodePresence::new([0u8; 32], &keypair);
        assert_eq!(presence.pubkey, *crate::crypto::Keypair::public_key(&keypair));
        assert!(presence.verify().is_ok());
    }

    #[test]
    fn grace_period_window_matches_constant() {
        // Sanity: the window is the last GRACE_PERIOD_SECS of a TAU2_SECS period.
        assert_eq!(TAU2_SECS - GRACE_PERIOD_SECS, 570);
    }
}
