//! Node weight dimensions and anti-cluster subsystem
//!
//! Computes the dimensionless `w` consumed by the lottery (`consensus`) and
//! fork choice (`fork_choice`): five weighted dimensions (§4.6), reduced by
//! a behavioral-cluster penalty, a global cluster cap, and a network-entropy
//! decay factor (§4.7).

use crate::types::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// DIMENSION CONSTANTS
// ============================================================================

pub const TIME_SATURATION_SECS: u64 = 15_552_000; // 180 days
pub const HANDSHAKE_SATURATION_PARTNERS: u64 = 10;
pub const GEOGRAPHY_DIVERSITY_SATURATION: u64 = 50;

pub const INTEGRITY_INVALID_SLICE_PENALTY: f64 = 0.15;
pub const INTEGRITY_INVALID_VRF_PENALTY: f64 = 0.20;
pub const INTEGRITY_INVALID_VDF_PENALTY: f64 = 0.25;
pub const INTEGRITY_SPAM_PENALTY: f64 = 0.20;
pub const INTEGRITY_EQUIVOCATION_PENALTY: f64 = 1.0;
pub const INTEGRITY_DECAY_PER_TAU3: f64 = 0.01;
pub const EQUIVOCATION_QUARANTINE_TAU3: u64 = 1; // one tau3 (14 days, per COOLDOWN_WINDOW_TAU2)

pub const W_TIME: f64 = 0.50;
pub const W_INTEGRITY: f64 = 0.20;
pub const W_STORAGE: f64 = 0.15;
pub const W_GEOGRAPHY: f64 = 0.10;
pub const W_HANDSHAKE: f64 = 0.05;

pub const CLUSTER_CORR_THRESHOLD: f64 = 0.7;
pub const CLUSTER_PENALTY_FLOOR: f64 = 0.5;
pub const CLUSTER_GLOBAL_CAP: f64 = 0.33;
pub const NETWORK_ENTROPY_THRESHOLD: f64 = 0.5;
pub const ENTROPY_DECAY_RATE: f64 = 0.001;
pub const ENTROPY_DECAY_FLOOR: f64 = 0.1;
pub const BYZANTINE_FINGERPRINT_WINDOW_SECS: u64 = 48 * 3600;

// ============================================================================
// PER-NODE INFRACTION / INTEGRITY TRACKING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Infraction {
    InvalidSlice,
    InvalidVrf,
    InvalidVdf,
    Spam,
    Equivocation,
}

impl Infraction {
    pub fn penalty(&self) -> f64 {
        match self {
            Infraction::InvalidSlice => INTEGRITY_INVALID_SLICE_PENALTY,
            Infraction::InvalidVrf => INTEGRITY_INVALID_VRF_PENALTY,
            Infraction::InvalidVdf => INTEGRITY_INVALID_VDF_PENALTY,
            Infraction::Spam => INTEGRITY_SPAM_PENALTY,
            Infraction::Equivocation => INTEGRITY_EQUIVOCATION_PENALTY,
        }
    }
}

/// Running integrity score for a single node, per §4.6's INTEGRITY dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub score: f64,
    /// τ₂ index until which this node is quarantined (w = 0), 0 if none.
    pub quarantine_until_tau2: u64,
}

impl Default for IntegrityRecord {
    fn default() -> Self {
        Self { score: 1.0, quarantine_until_tau2: 0 }
    }
}

impl IntegrityRecord {
    pub fn apply(&mut self, infraction: Infraction, current_tau2: u64, cooldown_window_tau2: u64) {
        self.score = (self.score - infraction.penalty()).max(0.0);
        if infraction == Infraction::Equivocation {
            self.quarantine_until_tau2 = current_tau2 + cooldown_window_tau2;
        }
    }

    pub fn decay_one_tau3(&mut self) {
        self.score = (self.score + INTEGRITY_DECAY_PER_TAU3).min(1.0);
    }

    pub fn is_quarantined(&self, current_tau2: u64) -> bool {
        current_tau2 < self.quarantine_until_tau2
    }
}

// ============================================================================
// WEIGHT DIMENSIONS
// ============================================================================

/// Raw, already-normalized-to-[0,1] dimension inputs for one node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WeightDimensions {
    pub time: f64,
    pub integrity: f64,
    pub storage: f64,
    pub geography: f64,
    pub handshake: f64,
}

impl WeightDimensions {
    /// `TIME`: saturates at 180 days of continuous presence-backed uptime.
    pub fn time_from_uptime(continuous_uptime_secs: u64) -> f64 {
        (continuous_uptime_secs as f64 / TIME_SATURATION_SECS as f64).min(1.0)
    }

    /// `STORAGE`: fraction of the canonical chain locally held.
    pub fn storage_from_counts(locally_stored: u64, total_canonical: u64) -> f64 {
        if total_canonical == 0 {
            return 1.0;
        }
        (locally_stored as f64 / total_canonical as f64).min(1.0)
    }

    /// `GEOGRAPHY`: rarity + diversity, best-effort (§4.6 open question).
    pub fn geography_from_counts(nodes_in_same_country: u64, distinct_countries: u64) -> f64 {
        let rarity = 1.0 / (1.0 + (1.0 + nodes_in_same_country as f64).log10());
        let diversity = (distinct_countries as f64 / GEOGRAPHY_DIVERSITY_SATURATION as f64).min(1.0);
        0.6 * rarity + 0.4 * diversity
    }

    /// `HANDSHAKE`: qualifying partner count, saturating at 10.
    pub fn handshake_from_partners(valid_handshake_partners: u64) -> f64 {
        (valid_handshake_partners as f64 / HANDSHAKE_SATURATION_PARTNERS as f64).min(1.0)
    }

    /// Aggregate per §4.6, pre-cluster-penalty and pre-entropy-decay.
    pub fn aggregate(&self) -> f64 {
        W_TIME * self.time
            + W_INTEGRITY * self.integrity
            + W_STORAGE * self.storage
            + W_GEOGRAPHY * self.geography
            + W_HANDSHAKE * self.handshake
    }
}

/// A node qualifies as a HANDSHAKE partner candidate if it clears every gate
/// in §4.6's definition (each side independently evaluated).
pub fn qualifies_for_handshake(dims: &WeightDimensions, country_registered: bool) -> bool {
    dims.time >= 0.9 && dims.integrity >= 0.8 && dims.storage >= 0.9 && country_registered
}

// ============================================================================
// BEHAVIORAL CORRELATION (§4.7)
// ============================================================================

/// Per-node behavioral sample over the 24h sliding correlation window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorSample {
    /// Action timestamps in milliseconds since window start, used for `timing`.
    pub action_times_ms: Vec<u64>,
    /// Counts per action type [slice, presence, relay, getdata], for `action_distribution`.
    pub action_counts: [u64; 4],
    /// Heights at which this node acted, for `height_pattern`.
    pub heights: HashSet<u64>,
}

impl BehaviorSample {
    fn timing_score(&self, other: &BehaviorSample) -> f64 {
        if self.action_times_ms.is_empty() || other.action_times_ms.is_empty() {
            return 0.0;
        }
        let mut matches = 0usize;
        let mut total = 0usize;
        for &a in &self.action_times_ms {
            for &b in &other.action_times_ms {
                total += 1;
                if a.abs_diff(b) <= 100 {
                    matches += 1;
                }
            }
        }
        if total == 0 {
            0.0
        } else {
            matches as f64 / total as f64
        }
    }

    fn action_distribution_score(&self, other: &BehaviorSample) -> f64 {
        let a = self.action_counts;
        let b = other.action_counts;
        let dot: f64 = (0..4).map(|i| a[i] as f64 * b[i] as f64).sum();
        let norm_a: f64 = (a.iter().map(|&x| (x * x) as f64).sum::<f64>()).sqrt();
        let norm_b: f64 = (b.iter().map(|&x| (x * x) as f64).sum::<f64>()).sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    fn height_pattern_score(&self, other: &BehaviorSample) -> f64 {
        if self.heights.is_empty() && other.heights.is_empty() {
            return 0.0;
        }
        let intersection = self.heights.intersection(&other.heights).count();
        let union = self.heights.union(&other.heights).count();
        if union == 0 {
            0.0
        } else {
            intersection as f64 / union as f64
        }
    }

    /// Pairwise behavioral correlation per §4.7.
    pub fn correlation(&self, other: &BehaviorSample) -> f64 {
        0.5 * self.timing_score(other)
            + 0.3 * self.action_distribution_score(other)
            + 0.2 * self.height_pattern_score(other)
    }
}

/// Union-find clustering of nodes whose pairwise correlation ≥ 0.7.
#[derive(Debug, Default)]
pub struct ClusterTracker {
    parent: HashMap<PublicKey, PublicKey>,
    /// Highest observed correlation to any other node, per node (for penalty).
    max_corr: HashMap<PublicKey, f64>,
}

impl ClusterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&mut self, key: &PublicKey) -> PublicKey {
        let parent = self.parent.entry(key.clone()).or_insert_with(|| key.clone()).clone();
        if &parent == key {
            key.clone()
        } else {
            let root = self.find(&parent);
            self.parent.insert(key.clone(), root.clone());
            root
        }
    }

    fn union(&mut self, a: &PublicKey, b: &PublicKey) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    /// Record a correlated pair; `corr` must already be the computed §4.7 value.
    pub fn observe_pair(&mut self, a: &PublicKey, b: &PublicKey, corr: f64) {
        let entry_a = self.max_corr.entry(a.clone()).or_insert(0.0);
        *entry_a = entry_a.max(corr);
        let entry_b = self.max_corr.entry(b.clone()).or_insert(0.0);
        *entry_b = entry_b.max(corr);

        if corr >= CLUSTER_CORR_THRESHOLD {
            self.union(a, b);
        }
    }

    /// Per-node multiplicative penalty: 1.0 at corr=0.7, 0.5 at corr=1.0, linear between.
    pub fn penalty_for(&self, node: &PublicKey) -> f64 {
        let max_corr = self.max_corr.get(node).copied().unwrap_or(0.0);
        if max_corr < CLUSTER_CORR_THRESHOLD {
            1.0
        } else {
            let span = 1.0 - CLUSTER_CORR_THRESHOLD;
            let excess = (max_corr - CLUSTER_CORR_THRESHOLD).min(span);
            1.0 - (1.0 - CLUSTER_PENALTY_FLOOR) * (excess / span)
        }
    }

    /// Group nodes by cluster root.
    pub fn clusters(&mut self) -> HashMap<PublicKey, Vec<PublicKey>> {
        let nodes: Vec<PublicKey> = self.parent.keys().cloned().collect();
        let mut groups: HashMap<PublicKey, Vec<PublicKey>> = HashMap::new();
        for node in nodes {
            let root = self.find(&node);
            groups.entry(root).or_default().push(node);
        }
        groups
    }
}

/// Apply the global 33% cluster cap in-place to `weights` (pubkey -> post-penalty w).
///
/// `byzantine_groups` are additional clusters from the fingerprint tracker
/// (§4.7's Global Byzantine tracker), folded in alongside correlation clusters.
pub fn apply_global_cluster_cap(
    weights: &mut HashMap<PublicKey, f64>,
    clusters: &HashMap<PublicKey, Vec<PublicKey>>,
    byzantine_groups: &[Vec<PublicKey>],
) {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return;
    }

    let mut groups: Vec<Vec<PublicKey>> = clusters.values().cloned().collect();
    groups.extend(byzantine_groups.iter().cloned());

    for group in &groups {
        let cluster_share: f64 = group.iter().filter_map(|k| weights.get(k)).sum();
        if cluster_share <= 0.0 {
            continue;
        }
        let share_ratio = cluster_share / total;
        if share_ratio > CLUSTER_GLOBAL_CAP {
            let scale = CLUSTER_GLOBAL_CAP / share_ratio;
            for key in group {
                if let Some(w) = weights.get_mut(key) {
                    *w *= scale;
                }
            }
        }
    }
}

// ============================================================================
// GLOBAL BYZANTINE TRACKER (§4.7)
// ============================================================================

/// Fingerprint of a node for Byzantine-cluster detection: created-at bucket
/// plus a coarse dimension profile, so jittered correlation can't evade it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeFingerprint {
    pub pubkey_hash: [u8; 8],
    pub created_at: u64,
    pub time_dim: f64,
}

/// Group nodes created within 48h of one another, all with TIME≥0.9.
pub fn fingerprint_byzantine_groups(fingerprints: &[(PublicKey, NodeFingerprint)]) -> Vec<Vec<PublicKey>> {
    let mut candidates: Vec<&(PublicKey, NodeFingerprint)> = fingerprints
        .iter()
        .filter(|(_, fp)| fp.time_dim >= 0.9)
        .collect();
    candidates.sort_by_key(|(_, fp)| fp.created_at);

    let mut groups: Vec<Vec<PublicKey>> = Vec::new();
    let mut current: Vec<&(PublicKey, NodeFingerprint)> = Vec::new();

    for entry in candidates {
        if let Some(first) = current.first() {
            if entry.1.created_at.abs_diff(first.1.created_at) > BYZANTINE_FINGERPRINT_WINDOW_SECS {
                if current.len() > 1 {
                    groups.push(current.iter().map(|(k, _)| k.clone()).collect());
                }
                current.clear();
            }
        }
        current.push(entry);
    }
    if current.len() > 1 {
        groups.push(current.iter().map(|(k, _)| k.clone()).collect());
    }
    groups
}

// ============================================================================
// NETWORK ENTROPY & DECAY (§4.7)
// ============================================================================

/// Gini coefficient over non-negative category counts.
pub fn gini(counts: &[u64]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len() as f64;
    let sum: f64 = sorted.iter().sum();
    if sum == 0.0 {
        return 0.0;
    }
    let weighted_sum: f64 = sorted.iter().enumerate().map(|(i, &x)| (i as f64 + 1.0) * x).sum();
    (2.0 * weighted_sum) / (n * sum) - (n + 1.0) / n
}

/// Normalized variance (coefficient of variation, clamped to [0,1]) of TIME dimension samples.
pub fn var_norm(time_samples: &[f64]) -> f64 {
    if time_samples.len() < 2 {
        return 0.0;
    }
    let mean: f64 = time_samples.iter().sum::<f64>() / time_samples.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance: f64 = time_samples.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / time_samples.len() as f64;
    (variance.sqrt() / mean).min(1.0)
}

/// Network-wide entropy score per §4.7. Inputs are already-aggregated stats.
pub fn network_entropy(
    country_counts: &[u64],
    city_counts: &[u64],
    time_samples: &[f64],
    handshake_country_span: f64,
) -> f64 {
    0.4 * gini(country_counts)
        + 0.25 * gini(city_counts)
        + 0.2 * var_norm(time_samples)
        + 0.15 * handshake_country_span.clamp(0.0, 1.0)
}

/// Multiplicative TIME-accumulation decay applied when entropy drops below
/// the threshold, keyed by consecutive hours spent below it.
pub fn entropy_decay_factor(entropy: f64, hours_below_threshold: f64) -> f64 {
    if entropy >= NETWORK_ENTROPY_THRESHOLD {
        return 1.0;
    }
    (-ENTROPY_DECAY_RATE * hours_below_threshold).exp().max(ENTROPY_DECAY_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_dimension_saturates_at_180_days() {
        assert_eq!(WeightDimensions::time_from_uptime(TIME_SATURATION_SECS * 2), 1.0);
        assert!(WeightDimensions::time_from_uptime(TIME_SATURATION_SECS / 2) < 1.0);
    }

    #[test]
    fn aggregate_weights_sum_to_one_at_full_score() {
        let dims = WeightDimensions { time: 1.0, integrity: 1.0, storage: 1.0, geography: 1.0, handshake: 1.0 };
        assert!((dims.aggregate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn integrity_equivocation_zeroes_and_quarantines() {
        let mut record = IntegrityRecord::default();
        record.apply(Infraction::Equivocation, 100, 2016);
        assert_eq!(record.score, 0.0);
        assert!(record.is_quarantined(100));
        assert!(!record.is_quarantined(100 + 2016));
    }

    #[test]
    fn integrity_decays_toward_one() {
        let mut record = IntegrityRecord { score: 0.5, quarantine_until_tau2: 0 };
        record.decay_one_tau3();
        assert!((record.score - 0.51).abs() < 1e-9);
    }

    #[test]
    fn cluster_penalty_is_identity_below_threshold() {
        let mut tracker = ClusterTracker::new();
        let a = vec![1u8; 32];
        let b = vec![2u8; 32];
        tracker.observe_pair(&a, &b, 0.5);
        assert_eq!(tracker.penalty_for(&a), 1.0);
    }

    #[test]
    fn cluster_penalty_reaches_floor_at_full_correlation() {
        let mut tracker = ClusterTracker::new();
        let a = vec![1u8; 32];
        let b = vec![2u8; 32];
        tracker.observe_pair(&a, &b, 1.0);
        assert!((tracker.penalty_for(&a) - CLUSTER_PENALTY_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn global_cluster_cap_scales_down_oversized_cluster() {
        let a = vec![1u8; 32];
        let b = vec![2u8; 32];
        let c = vec![3u8; 32];

        let mut weights = HashMap::new();
        weights.insert(a.clone(), 0.5);
        weights.insert(b.clone(), 0.4);
        weights.insert(c.clone(), 0.1);

        let mut clusters = HashMap::new();
        clusters.insert(a.clone(), vec![a.clone(), b.clone()]);

        apply_global_cluster_cap(&mut weights, &clusters, &[]);

        let cluster_share = weights[&a] + weights[&b];
        let total: f64 = weights.values().sum();
        assert!(cluster_share / total <= CLUSTER_GLOBAL_CAP + 1e-9);
    }

    #[test]
    fn byzantine_fingerprints_group_nodes_created_within_window() {
        let a = vec![1u8; 32];
        let b = vec![2u8; 32];
        let c = vec![3u8; 32];

        let fp = |created_at: u64| NodeFingerprint { pubkey_hash: [0u8; 8], created_at, time_dim: 0.95 };

        let fingerprints = vec![
            (a.clone(), fp(0)),
            (b.clone(), fp(3600)),
            (c.clone(), fp(BYZANTINE_FINGERPRINT_WINDOW_SECS * 10)),
        ];

        let groups = fingerprint_byzantine_groups(&fingerprints);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].contains(&a));
        assert!(groups[0].contains(&b));
        assert!(!groups[0].contains(&c));
    }

    #[test]
    fn entropy_decay_is_identity_above_threshold() {
        assert_eq!(entropy_decay_factor(0.9, 1000.0), 1.0);
    }

    #[test]
    fn entropy_decay_drops_below_threshold_over_time() {
        let factor = entropy_decay_factor(0.1, 500.0);
        assert!(factor < 1.0);
        assert!(factor >= ENTROPY_DECAY_FLOOR);
    }
}
