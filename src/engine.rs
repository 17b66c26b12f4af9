//! Montana Consensus Engine
//!
//! Integrates every layer:
//! - consensus.rs — lottery, presence evidence, slice validation
//! - types.rs — wire structures
//! - cooldown.rs — adaptive cooldown
//! - weight.rs — node weight dimensions, anti-cluster
//! - crypto.rs — VDF/VRF/signatures
//! - finality.rs — checkpoints
//! - fork_choice.rs — chain selection
//! - db.rs — persistence
//! - net — peer-to-peer transport

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Duration, Instant};

use crate::consensus::{
    self, FullNodePresence, Lottery, LotteryCandidate, LotteryResult, SLOTS_PER_TAU2, TAU1_SECS,
    TAU2_SECS,
};
use crate::cooldown::AdaptiveCooldown;
use crate::crypto::{self, MlDsa65PublicKey};
use crate::db::Storage;
use crate::finality::{FinalityTracker, SliceAttestation};
use crate::fork_choice::{ChainHead, ForkChoice, ReorgResult};
use crate::merkle::MerkleTree;
use crate::net::{NetEvent, Network};
use crate::types::{
    self, Hash, NodeType, NodeWeight, PresenceProof, PublicKey, Slice, SliceHeader, Transaction,
    TxOutput,
};
use crate::weight::{ClusterTracker, WeightDimensions};

/// Sequential-hash iterations for the VDF stand-in (crypto::vdf_compute).
/// Tunable; binds the minimum wall-clock delay between seed and output.
const VDF_ITERATIONS: u64 = 10_000;

/// Montana node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_type: NodeType,
    pub genesis_hash: Hash,
    pub tau1_interval: Duration,
    pub tau2_interval: Duration,
}

/// Main Montana node: ties the consensus engine to its network transport.
pub struct MontanaNode {
    config: Config,
    state: RwLock<NodeState>,
    consensus: Arc<ConsensusEngine>,
    network: Arc<Network>,
}

impl MontanaNode {
    pub fn new(
        config: Config,
        keypair: crate::crypto::Keypair,
        storage: Storage,
        network: Arc<Network>,
        event_rx: mpsc::Receiver<NetEvent>,
    ) -> Self {
        let consensus = Arc::new(ConsensusEngine::new(
            config.clone(),
            keypair,
            storage,
            network.clone(),
            event_rx,
        ));
        let state = RwLock::new(NodeState::Syncing { progress: 0.0 });

        Self { config, state, consensus, network }
    }

    pub async fn start(&self) -> Result<(), MontanaError> {
        self.consensus.start().await?;
        *self.state.write().await = NodeState::Active;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MontanaError> {
        self.consensus.stop().await?;
        *self.state.write().await = NodeState::Offline;
        Ok(())
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn peer_count(&self) -> usize {
        self.network.peer_count().await
    }
}

/// Where a producer attempt for the current τ₂ stands.
#[derive(Debug, Clone)]
enum ProducerState {
    Idle,
    /// We ran the lottery for `lottery_result.tau2_index`; `next_slot_to_try`
    /// is the next backup slot we'll attempt once `deadline` passes without
    /// the chain head advancing past this τ₂.
    WaitingForSlice { lottery_result: LotteryResult, deadline: Instant, next_slot_to_try: u32 },
}

/// Consensus engine — runs the τ₁/τ₂ main loop.
pub struct ConsensusEngine {
    config: Config,
    keypair: crate::crypto::Keypair,
    storage: Storage,
    network: Arc<Network>,
    event_rx: RwLock<mpsc::Receiver<NetEvent>>,
    fork_choice: RwLock<ForkChoice>,
    finality: RwLock<FinalityTracker>,
    cooldown: RwLock<AdaptiveCooldown>,
    cluster: RwLock<ClusterTracker>,
    /// This node's own τ₁ bitmap accumulator, keyed by τ₂ index.
    own_bitmap: RwLock<HashMap<u64, u16>>,
    producer_state: RwLock<ProducerState>,
    current_tau2: RwLock<u64>,
    running: RwLock<bool>,
    listeners: RwLock<Vec<Box<dyn ConsensusListener>>>,
}

impl ConsensusEngine {
    pub fn new(
        config: Config,
        keypair: crate::crypto::Keypair,
        storage: Storage,
        network: Arc<Network>,
        event_rx: mpsc::Receiver<NetEvent>,
    ) -> Self {
        let _ = storage.init_genesis();

        Self {
            fork_choice: RwLock::new(ForkChoice::new(config.genesis_hash)),
            finality: RwLock::new(FinalityTracker::new()),
            cooldown: RwLock::new(AdaptiveCooldown::new()),
            cluster: RwLock::new(ClusterTracker::new()),
            own_bitmap: RwLock::new(HashMap::new()),
            producer_state: RwLock::new(ProducerState::Idle),
            current_tau2: RwLock::new(consensus::current_tau2_index()),
            running: RwLock::new(false),
            listeners: RwLock::new(Vec::new()),
            config,
            keypair,
            storage,
            network,
            event_rx: RwLock::new(event_rx),
        }
    }

    pub async fn add_listener(&self, listener: Box<dyn ConsensusListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Start the main consensus loop in the background.
    pub async fn start(self: &Arc<Self>) -> Result<(), MontanaError> {
        let mut running = self.running.write().await;
        if *running {
            return Err(MontanaError::AlreadyRunning);
        }
        *running = true;
        drop(running);

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await });

        Ok(())
    }

    pub async fn stop(&self) -> Result<(), MontanaError> {
        *self.running.write().await = false;
        Ok(())
    }

    /// Main consensus loop — one tick per τ₁.
    pub async fn run(&self) {
        let tau1_duration = Duration::from_secs(TAU1_SECS);

        while *self.running.read().await {
            let tick_start = Instant::now();

            self.wait_for_tau1().await;

            if matches!(self.config.node_type, NodeType::Full) {
                if let Err(e) = self.sign_presence().await {
                    tracing::warn!(error = ?e, "presence signing failed");
                }
            }

            if self.tau2_ended().await {
                if let Err(e) = self.finalize_tau2().await {
                    tracing::warn!(error = ?e, "tau2 finalization failed");
                }
            }

            if let Err(e) = self.process_pending_slices().await {
                tracing::warn!(error = ?e, "slice processing failed");
            }

            if let Err(e) = self.check_producer_timeout().await {
                tracing::warn!(error = ?e, "producer timeout check failed");
            }

            let elapsed = tick_start.elapsed();
            if elapsed < tau1_duration {
                time::sleep(tau1_duration - elapsed).await;
            }
        }
    }

    async fn wait_for_tau1(&self) {
        let now = now_secs();
        let tau1_boundary = (now / TAU1_SECS) * TAU1_SECS + TAU1_SECS;
        let wait_time = tau1_boundary - now;

        if wait_time > 0 {
            time::sleep(Duration::from_secs(wait_time)).await;
        }
    }

    /// Record this τ₁'s automatic presence signal in the running bitmap for
    /// the current τ₂ — folded into a `PresenceProof` at `finalize_tau2`.
    async fn sign_presence(&self) -> Result<(), MontanaError> {
        let current_tau2 = *self.current_tau2.read().await;
        let prev_hash = self.get_prev_slice_hash().await;
        let presence = FullNodePresence::new(prev_hash, &self.keypair);
        presence.verify().map_err(MontanaError::Presence)?;

        let slots_per_tau2 = TAU2_SECS / TAU1_SECS;
        let slot = ((presence.timestamp / TAU1_SECS) % slots_per_tau2) as u16;

        let mut bitmaps = self.own_bitmap.write().await;
        *bitmaps.entry(current_tau2).or_insert(0u16) |= 1 << slot;
        Ok(())
    }

    async fn tau2_ended(&self) -> bool {
        let now = now_secs();
        let current_tau2 = *self.current_tau2.read().await;
        now >= (current_tau2 + 1) * TAU2_SECS
    }

    /// Fold this τ₂'s accumulated bitmap into a signed `PresenceProof`,
    /// persist it, and broadcast it.
    async fn assemble_own_presence_proof(&self, current_tau2: u64) -> Result<(), MontanaError> {
        let prev_hash = self.get_prev_slice_hash().await;
        let bitmap = self.own_bitmap.write().await.remove(&current_tau2).unwrap_or(0);

        let unsigned = PresenceProof {
            pubkey: self.keypair.public_key().clone(),
            tau2_index: current_tau2,
            tau1_bitmap: bitmap,
            prev_slice_hash: prev_hash,
            timestamp: now_secs(),
            signature: vec![],
            cooldown_until: 0,
        };
        let signature = self.keypair.sign(&consensus::presence_message(&unsigned));
        let proof = PresenceProof { signature, ..unsigned };

        self.storage.put_presence(&proof).map_err(to_montana_err)?;
        self.network.broadcast_presence(&proof).await;
        Ok(())
    }

    async fn collect_presences(&self, current_tau2: u64) -> Result<Vec<PresenceProof>, MontanaError> {
        self.storage.get_presence_for_tau2(current_tau2).map_err(to_montana_err)
    }

    async fn get_prev_slice_hash(&self) -> Hash {
        self.load_prev_slice().await.map(|s| s.header.hash()).unwrap_or(self.config.genesis_hash)
    }

    async fn load_prev_slice(&self) -> Result<Slice, MontanaError> {
        let head_idx = self.storage.head().map_err(to_montana_err)?;
        self.storage.get_slice(head_idx).map_err(to_montana_err)
    }

    /// First registration this node makes of itself, so it has a `NodeWeight`
    /// record to enter the lottery with.
    async fn ensure_self_registered(&self, current_tau2: u64) -> Result<(), MontanaError> {
        let pubkey = self.keypair.public_key().clone();
        if self.storage.get_weight(&pubkey).is_err() {
            let weight = NodeWeight::genesis(pubkey, self.config.node_type);
            self.storage.put_weight(&weight).map_err(to_montana_err)?;
            self.cooldown.write().await.record_registration(current_tau2, self.config.node_type);
        }
        Ok(())
    }

    /// Compose a persisted `NodeWeight` into the dimensionless `w` the
    /// lottery consumes. TIME comes from accumulated tier-slice history;
    /// STORAGE reflects how much of the local chain is held (by
    /// construction, everything up to our own head); GEOGRAPHY and
    /// HANDSHAKE are left at neutral defaults — this engine has no
    /// geolocation or peer-handshake telemetry of its own.
    fn compose_weight(&self, node_weight: &NodeWeight, cluster: &ClusterTracker) -> f64 {
        let continuous_uptime_secs =
            (node_weight.tier3_slices * types::COOLDOWN_WINDOW_TAU2 + node_weight.tier2_slices)
                * TAU2_SECS;

        let dims = WeightDimensions {
            time: WeightDimensions::time_from_uptime(continuous_uptime_secs),
            integrity: 1.0,
            storage: WeightDimensions::storage_from_counts(1, 1),
            geography: 0.5,
            handshake: 0.0,
        };

        let penalty = cluster.penalty_for(&node_weight.pubkey);
        (dims.aggregate() * penalty).clamp(0.0, 1.0)
    }

    async fn run_lottery(&self, prev_slice_hash: Hash, current_tau2: u64) -> Result<LotteryResult, MontanaError> {
        self.ensure_self_registered(current_tau2).await?;

        let eligible = self.storage.get_eligible_weights(current_tau2).map_err(to_montana_err)?;
        let cluster = self.cluster.read().await;

        let mut lottery = Lottery::new(prev_slice_hash, current_tau2);
        for node_weight in &eligible {
            lottery.add_candidate(LotteryCandidate {
                pubkey: node_weight.pubkey.clone(),
                node_type: node_weight.node_type,
                weight: self.compose_weight(node_weight, &cluster),
                cooldown_until: node_weight.cooldown_until,
            });
        }

        Ok(lottery.run())
    }

    /// Runs once per τ₂: assembles our own presence, runs the lottery, and
    /// produces a slice immediately if we're the primary (slot 0) winner.
    /// Backup slots are tried later by `check_producer_timeout`.
    async fn finalize_tau2(&self) -> Result<(), MontanaError> {
        let current_tau2 = *self.current_tau2.read().await;

        if matches!(self.config.node_type, NodeType::Full) {
            self.assemble_own_presence_proof(current_tau2).await?;
        }

        let presences = self.collect_presences(current_tau2).await?;
        let prev_slice_hash = self.get_prev_slice_hash().await;
        let lottery_result = self.run_lottery(prev_slice_hash, current_tau2).await?;

        self.try_produce_for_slot(&lottery_result, 0, &presences).await?;

        *self.producer_state.write().await = ProducerState::WaitingForSlice {
            lottery_result,
            deadline: Instant::now() + Duration::from_secs(TAU2_SECS + 2 * TAU1_SECS),
            next_slot_to_try: 1,
        };

        *self.current_tau2.write().await = current_tau2 + 1;
        self.cooldown.write().await.update_snapshot(current_tau2, self.config.node_type);
        Ok(())
    }

    /// Checked once per τ₁: if the chain head hasn't advanced past our
    /// lottery's τ₂ by the deadline, try the next backup slot.
    async fn check_producer_timeout(&self) -> Result<(), MontanaError> {
        let (lottery_result, slot) = {
            let mut state = self.producer_state.write().await;
            let ProducerState::WaitingForSlice { lottery_result, deadline, next_slot_to_try } = &mut *state else {
                return Ok(());
            };

            let head_past_due = self.storage.head().map(|h| h >= lottery_result.tau2_index).unwrap_or(false);
            if head_past_due {
                *state = ProducerState::Idle;
                return Ok(());
            }

            if Instant::now() < *deadline || *next_slot_to_try as u64 >= SLOTS_PER_TAU2 {
                return Ok(());
            }

            let slot = *next_slot_to_try;
            let lottery_result = lottery_result.clone();
            *next_slot_to_try += 1;
            *deadline = Instant::now() + Duration::from_secs(TAU1_SECS);
            (lottery_result, slot)
        };

        let presences = self.collect_presences(lottery_result.tau2_index).await?;
        self.try_produce_for_slot(&lottery_result, slot, &presences).await
    }

    async fn try_produce_for_slot(
        &self,
        lottery_result: &LotteryResult,
        slot: u32,
        presences: &[PresenceProof],
    ) -> Result<(), MontanaError> {
        let Some(winner) = lottery_result.winner_for_slot(slot) else {
            return Ok(());
        };
        if &winner.pubkey != self.keypair.public_key() {
            return Ok(());
        }

        self.notify(ConsensusEvent::LotteryWon { tau2_index: lottery_result.tau2_index, slot }).await;

        let slice = self.produce_slice(lottery_result, presences).await?;
        self.broadcast_slice(&slice).await;
        self.verify_and_apply_slice(slice).await
    }

    async fn produce_slice(
        &self,
        lottery_result: &LotteryResult,
        presences: &[PresenceProof],
    ) -> Result<Slice, MontanaError> {
        let prev_slice = self.load_prev_slice().await?;
        let prev_hash = prev_slice.header.hash();
        let slice_index = prev_slice.header.slice_index + 1;
        let winner_pubkey = self.keypair.public_key().clone();

        let presence_leaves: Vec<Hash> = presences.iter().map(|p| p.hash()).collect();
        let presence_root = MerkleTree::new(presence_leaves).root();

        let reward_tx = Transaction {
            inputs: vec![],
            outputs: vec![TxOutput {
                amount: types::calculate_reward(slice_index),
                pubkey: winner_pubkey.clone(),
            }],
        };
        let tx_root = MerkleTree::new(vec![reward_tx.hash()]).root();

        let vdf_input = crypto::sha3_concat(&prev_hash, &slice_index.to_le_bytes());
        let (vdf_output, vdf_proof) = crypto::vdf_compute(&vdf_input, VDF_ITERATIONS);

        let (vrf_output, vrf_proof) = crypto::vrf_prove(&self.keypair.secret_bytes(), &lottery_result.seed)
            .ok_or_else(|| MontanaError::Crypto("VRF proving failed".into()))?;

        let cooldown = self.cooldown.read().await;
        let cooldown_medians = [
            cooldown.get_median(NodeType::Full),
            cooldown.get_median(NodeType::Light),
            cooldown.get_median(NodeType::Client),
        ];
        drop(cooldown);

        let cumulative_weight = prev_slice.header.cumulative_weight + presences.len() as u64;

        let header = SliceHeader {
            prev_hash,
            timestamp: now_secs(),
            slice_index,
            winner_pubkey,
            cooldown_medians,
            registrations: [0, 0, 0],
            cumulative_weight,
            subnet_reputation_root: [0u8; 32],
            vdf_output,
            vdf_proof,
            vrf_output,
            vrf_proof,
        };
        let signature = self.keypair.sign(&header.hash());

        Ok(Slice {
            header,
            presence_root,
            tx_root,
            signature,
            presences: presences.to_vec(),
            transactions: vec![reward_tx],
        })
    }

    async fn broadcast_slice(&self, slice: &Slice) {
        self.network.broadcast_slice(slice).await;
    }

    /// Drain incoming network events, applying slices and persisting
    /// presences as they arrive.
    async fn process_pending_slices(&self) -> Result<(), MontanaError> {
        let mut rx = self.event_rx.write().await;
        loop {
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };

            match event {
                NetEvent::Slice(_addr, slice) => {
                    drop(rx);
                    if let Err(e) = self.verify_and_apply_slice(*slice).await {
                        tracing::warn!(error = ?e, "rejected incoming slice");
                    }
                    rx = self.event_rx.write().await;
                }
                NetEvent::Presence(_addr, proof) => {
                    let _ = self.storage.put_presence(&proof);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn verify_and_apply_slice(&self, slice: Slice) -> Result<(), MontanaError> {
        self.validate_slice(&slice).await?;

        let equivocators = self.detect_equivocators(&slice);

        self.storage.put_slice(&slice).map_err(to_montana_err)?;
        self.record_producer_weight(&slice).await?;

        let weight = self.calculate_slice_weight(&slice);
        let head = ChainHead::from_slice_header(
            slice.header.hash(),
            slice.header.prev_hash,
            slice.header.slice_index,
            slice.header.slice_index,
            weight,
        );

        let should_reorg = {
            let mut fork_choice = self.fork_choice.write().await;
            fork_choice.add_head(head.clone())?;
            fork_choice.should_reorg(&head)
        };

        if should_reorg {
            let result = self.fork_choice.write().await.reorg_to(head.clone(), &equivocators)?;
            self.handle_reorg(result).await?;
        }

        self.notify(ConsensusEvent::SliceAccepted {
            hash: slice.header.hash(),
            height: slice.header.slice_index,
        })
        .await;

        self.update_finality(&slice).await
    }

    /// Same producer claiming the slot this τ₂ already holds locally, under
    /// a different hash — i.e. equivocation.
    fn detect_equivocators(&self, new_slice: &Slice) -> Vec<PublicKey> {
        match self.storage.get_slice(new_slice.header.slice_index) {
            Ok(existing)
                if existing.header.winner_pubkey == new_slice.header.winner_pubkey
                    && existing.header.hash() != new_slice.header.hash() =>
            {
                vec![new_slice.header.winner_pubkey.clone()]
            }
            _ => vec![],
        }
    }

    /// Full 8-point slice validation: parent linkage, timestamp bounds, VDF,
    /// VRF + lottery eligibility, presence/tx roots, presence-level checks,
    /// transaction validity against the UTXO set, and the producer signature.
    async fn validate_slice(&self, slice: &Slice) -> Result<(), MontanaError> {
        let parent_index = slice
            .header
            .slice_index
            .checked_sub(1)
            .ok_or_else(|| MontanaError::Consensus("genesis slice cannot be re-validated".into()))?;
        let parent = self
            .storage
            .get_slice(parent_index)
            .map_err(|_| MontanaError::Consensus("parent slice not found".into()))?;
        if parent.header.hash() != slice.header.prev_hash {
            return Err(MontanaError::Consensus("prev_hash does not match stored parent".into()));
        }

        let now = now_secs();
        if slice.header.timestamp < parent.header.timestamp || slice.header.timestamp > now + 5 {
            return Err(MontanaError::Consensus("slice timestamp out of bounds".into()));
        }

        let vdf_input = crypto::sha3_concat(&slice.header.prev_hash, &slice.header.slice_index.to_le_bytes());
        if !crypto::vdf_verify(&vdf_input, &slice.header.vdf_output, &slice.header.vdf_proof, VDF_ITERATIONS) {
            return Err(MontanaError::Consensus("VDF verification failed".into()));
        }

        let lottery_result = self.run_lottery(slice.header.prev_hash, slice.header.slice_index).await?;
        let slot = lottery_result
            .winners
            .iter()
            .find(|w| w.pubkey == slice.header.winner_pubkey)
            .map(|w| w.slot)
            .ok_or_else(|| MontanaError::Consensus("producer did not win the lottery for this slice".into()))?;

        let winner_pubkey_fixed = to_mldsa_pubkey(&slice.header.winner_pubkey)
            .ok_or_else(|| MontanaError::Consensus("malformed winner public key".into()))?;
        if !crypto::vrf_verify(&winner_pubkey_fixed, &lottery_result.seed, &slice.header.vrf_output, &slice.header.vrf_proof)
        {
            return Err(MontanaError::Consensus("VRF verification failed".into()));
        }

        consensus::verify_slice(slice, &lottery_result, slot)
            .map_err(|e| MontanaError::Consensus(format!("{e:?}")))?;

        let mut seen = HashSet::new();
        for presence in &slice.presences {
            if !seen.insert(presence.pubkey.clone()) {
                return Err(MontanaError::Consensus("duplicate presence in slice".into()));
            }
            if presence.tau2_index != slice.header.slice_index {
                return Err(MontanaError::Consensus("presence tau2_index mismatch".into()));
            }
            if presence.in_cooldown() {
                return Err(MontanaError::Consensus("presence from a cooling-down node".into()));
            }
        }

        for tx in &slice.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                self.storage
                    .get_utxo(&input.prev_tx, input.output_index)
                    .map_err(|_| MontanaError::Consensus("transaction spends an unknown UTXO".into()))?;
            }
        }

        let tx_leaves: Vec<Hash> = slice.transactions.iter().map(|tx| tx.hash()).collect();
        if MerkleTree::new(tx_leaves).root() != slice.tx_root {
            return Err(MontanaError::Consensus("tx root mismatch".into()));
        }

        Ok(())
    }

    async fn record_producer_weight(&self, slice: &Slice) -> Result<(), MontanaError> {
        let pubkey = &slice.header.winner_pubkey;
        let mut weight = self
            .storage
            .get_weight(pubkey)
            .unwrap_or_else(|_| NodeWeight::new(pubkey.clone(), NodeType::Full, 0));
        weight.add_tier2(slice.header.slice_index);
        self.storage.put_weight(&weight).map_err(to_montana_err)
    }

    /// A slice's weight is whatever its producer already committed to in the
    /// header — fork choice compares committed weight, it doesn't recompute it.
    fn calculate_slice_weight(&self, slice: &Slice) -> u64 {
        slice.header.cumulative_weight
    }

    async fn handle_reorg(&self, result: ReorgResult) -> Result<(), MontanaError> {
        let new_head_hash = self.fork_choice.read().await.canonical_head().hash;
        self.notify(ConsensusEvent::Reorg { depth: result.depth, new_head: new_head_hash }).await;
        Ok(())
    }

    async fn update_finality(&self, slice: &Slice) -> Result<(), MontanaError> {
        let slice_index = slice.header.slice_index;
        let hash = slice.header.hash();

        let attestation = SliceAttestation {
            slice_hash: hash,
            attester_pubkey: self.keypair.public_key().clone(),
            attester_weight: 1,
            slice_index,
            signature: self.keypair.sign(&hash),
        };

        let mut finality = self.finality.write().await;
        let _ = finality.add_attestation(attestation);
        finality.update_head(slice_index);

        if let Some(checkpoint) = finality.create_checkpoint(slice_index, slice) {
            self.fork_choice.write().await.set_finalized(checkpoint.slice_hash, checkpoint.slice_index);
            drop(finality);
            self.notify(ConsensusEvent::CheckpointFinalized { tau3_index: checkpoint.tau3_index }).await;
        }

        Ok(())
    }

    async fn notify(&self, event: ConsensusEvent) {
        let mut listeners = self.listeners.write().await;
        for listener in listeners.iter_mut() {
            listener.on_event(&event);
        }
    }
}

fn to_montana_err(e: crate::db::DbError) -> MontanaError {
    MontanaError::Storage(e.to_string())
}

fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs()
}

fn to_mldsa_pubkey(pubkey: &PublicKey) -> Option<MlDsa65PublicKey> {
    pubkey.as_slice().try_into().ok()
}

/// Node state as seen from the outside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeState {
    Syncing { progress: f64 },
    Active,
    Cooldown { until_tau2: u64 },
    Offline,
}

/// Consensus events a listener can react to.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    SliceAccepted { hash: Hash, height: u64 },
    Reorg { depth: u32, new_head: Hash },
    CheckpointFinalized { tau3_index: u64 },
    LotteryWon { tau2_index: u64, slot: u32 },
    CooldownStarted { until_tau2: u64 },
}

/// Listener for consensus events.
pub trait ConsensusListener: Send + Sync {
    fn on_event(&mut self, event: &ConsensusEvent);
}

#[derive(Debug, thiserror::Error)]
pub enum MontanaError {
    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("presence error: {0:?}")]
    Presence(consensus::PresenceError),

    #[error("fork choice error: {0}")]
    ForkChoice(#[from] crate::fork_choice::ForkChoiceError),

    #[error("finality error: {0}")]
    Finality(#[from] crate::finality::FinalityError),

    #[error("already running")]
    AlreadyRunning,

    #[error("slice timeout")]
    SliceTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn test_config() -> Config {
        Config {
            node_type: NodeType::Full,
            genesis_hash: [0u8; 32],
            tau1_interval: Duration::from_secs(60),
            tau2_interval: Duration::from_secs(600),
        }
    }

    async fn open_test_storage(name: &str) -> Storage {
        let path = std::env::temp_dir().join(format!("montana_engine_test_{name}_{}", now_secs()));
        Storage::open(path).unwrap()
    }

    async fn test_network(name: &str) -> (Arc<Network>, mpsc::Receiver<NetEvent>) {
        let data_dir = std::env::temp_dir().join(format!("montana_engine_net_{name}_{}", now_secs()));
        std::fs::create_dir_all(&data_dir).unwrap();
        let net_config = crate::net::NetConfig { data_dir, listen_port: 0, ..Default::default() };
        let (network, rx) = Network::new(net_config).await.unwrap();
        (Arc::new(network), rx)
    }

    #[tokio::test]
    async fn test_node_creation() {
        let storage = open_test_storage("node_creation").await;
        let (network, event_rx) = test_network("node_creation").await;
        let keypair = Keypair::generate();

        let node = MontanaNode::new(test_config(), keypair, storage, network, event_rx);

        assert!(matches!(node.state().await, NodeState::Syncing { .. }));
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let storage = open_test_storage("engine_creation").await;
        let (network, event_rx) = test_network("engine_creation").await;
        let keypair = Keypair::generate();

        let engine = ConsensusEngine::new(test_config(), keypair, storage, network, event_rx);
        assert_eq!(engine.config.node_type, NodeType::Full);
    }

    #[tokio::test]
    async fn test_tau2_boundary_detection() {
        let storage = open_test_storage("tau2_boundary").await;
        let (network, event_rx) = test_network("tau2_boundary").await;
        let keypair = Keypair::generate();

        let engine = ConsensusEngine::new(test_config(), keypair, storage, network, event_rx);

        *engine.current_tau2.write().await = consensus::current_tau2_index();
        assert!(!engine.tau2_ended().await);
    }

    #[tokio::test]
    async fn weight_composition_stays_within_unit_interval() {
        let storage = open_test_storage("weight_composition").await;
        let (network, event_rx) = test_network("weight_composition").await;
        let keypair = Keypair::generate();

        let engine = ConsensusEngine::new(test_config(), keypair, storage, network, event_rx);
        let cluster = engine.cluster.read().await;

        let fresh = NodeWeight::genesis(vec![1u8; 1952], NodeType::Full);
        let w = engine.compose_weight(&fresh, &cluster);
        assert!((0.0..=1.0).contains(&w));

        let mut seasoned = NodeWeight::genesis(vec![2u8; 1952], NodeType::Full);
        seasoned.tier3_slices = 10;
        let w2 = engine.compose_weight(&seasoned, &cluster);
        assert!(w2 > w);
    }

    #[tokio::test]
    async fn genesis_slice_is_its_own_parent_free_chain() {
        let storage = open_test_storage("genesis_chain").await;
        let genesis = storage.init_genesis().unwrap();
        assert_eq!(genesis.header.slice_index, 0);
        assert_eq!(storage.head().unwrap(), 0);
    }
}
