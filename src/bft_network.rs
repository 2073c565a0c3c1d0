//! Round-based transport.
//!
//! The network owns the participant registry and the delivery schedule. A
//! round is always `deliver()` -> `step_all()` -> `flush()`:
//!
//! 1. envelopes due this round (or earlier) move into inbound queues
//! 2. every participant steps once against that inbound snapshot
//! 3. fresh outbound envelopes get a delivery round from the delay model
//!
//! Since outbound envelopes only enter the schedule in step 3 and the round has
//! already been delivered, nothing a participant sends can be seen by another
//! participant in the same round.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::bft_config::SimConfig;
use crate::bft_delay::DelayModel;
use crate::bft_error::SimError;
use crate::bft_interface::{Envelope, EnvelopeId, Participant, PeerId, Round, CLIENT_ID};
use crate::bft_metrics::RunMetrics;

/// Matching votes needed to advance a phase: `⌈n·f⌉ + 1`, never more than `n`.
///
/// A product `n·f` at most `1e-9` above an integer counts as that integer, so
/// float noise such as `10 * 0.3 = 3.0000000000000004` does not add a vote.
/// Fractions that are meant to land just above an integer must clear that
/// tolerance. Non-decreasing in both `n` and `f`.
pub fn quorum_size(participant_count: usize, fault_fraction: f64) -> usize {
    let faulty = (participant_count as f64 * fault_fraction - 1e-9).ceil().max(0.0) as usize;
    (faulty + 1).min(participant_count)
}

pub struct Network<P: Participant> {
    config: SimConfig,
    peers: IndexMap<PeerId, P>,
    delay: DelayModel,
    rng: StdRng,
    seed: [u8; 32],

    // delivery round -> envelopes in send order
    schedule: BTreeMap<Round, Vec<Envelope<P::Message>>>,
    round: Round,
    initialized: bool,
    next_envelope_id: EnvelopeId,

    // Metrics
    total_messages: usize,
    total_requests: usize,
    throughput: Vec<usize>,

    // Byzantine roster, oldest flag first
    byzantine_bound: usize,
    byzantine_order: Vec<PeerId>,
}

impl<P: Participant> Network<P> {
    pub fn new(config: SimConfig) -> Self {
        let seed = config.resolve_seed();
        Self::with_seed(config, seed)
    }

    pub fn with_seed(config: SimConfig, seed: [u8; 32]) -> Self {
        Self {
            delay: config.delay.clone(),
            config,
            peers: IndexMap::new(),
            rng: StdRng::from_seed(seed),
            seed,
            schedule: BTreeMap::new(),
            round: 0,
            initialized: false,
            next_envelope_id: 1,
            total_messages: 0,
            total_requests: 0,
            throughput: Vec::new(),
            byzantine_bound: 0,
            byzantine_order: Vec::new(),
        }
    }

    /// Register a participant. Registry order is insertion order.
    pub fn add_peer(&mut self, peer: P) -> Result<(), SimError> {
        if self.initialized {
            return Err(SimError::AlreadyInitialized);
        }
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return Err(SimError::DuplicatePeer(id));
        }
        self.peers.insert(id, peer);
        Ok(())
    }

    /// Validate the registry, connect participants without explicit neighbors
    /// to everyone else, and run the one-time `init_parameters` hook.
    pub fn init(&mut self) -> Result<(), SimError> {
        if self.initialized {
            return Err(SimError::AlreadyInitialized);
        }
        if self.peers.is_empty() {
            return Err(SimError::EmptyNetwork);
        }
        self.delay.validate()?;

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in self.peers.values_mut() {
            if peer.core().neighbors().is_empty() {
                peer.core_mut().set_neighbors(ids.iter().copied());
            }
        }

        let mut refs: Vec<&mut P> = self.peers.values_mut().collect();
        P::init_parameters(&mut refs, &self.config, &mut self.rng)?;

        self.byzantine_bound = self.config.byzantine_bound(self.peers.len());
        self.initialized = true;
        debug!(
            "network initialized: {} participants, byzantine bound {}",
            self.peers.len(),
            self.byzantine_bound
        );
        Ok(())
    }

    /// Hand an envelope to the transport. It becomes deliverable at
    /// `current round + Δ`.
    pub fn send(&mut self, envelope: Envelope<P::Message>) {
        if !self.peers.contains_key(&envelope.target) {
            warn!(
                "dropping envelope {} from {}: unknown target {}",
                envelope.id, envelope.source, envelope.target
            );
            return;
        }
        let delivery_round = self.round.saturating_add(self.delay.sample(&mut self.rng));
        let mut envelope = envelope;
        envelope.delivery_round = delivery_round;

        self.total_messages += 1;
        self.schedule.entry(delivery_round).or_default().push(envelope);
    }

    /// Move every envelope due at or before the current round into its
    /// target's inbound queue, preserving send order. Returns the number
    /// delivered.
    pub fn deliver(&mut self) -> usize {
        let later = self.schedule.split_off(&(self.round + 1));
        let due = std::mem::replace(&mut self.schedule, later);

        let mut delivered = 0;
        for (_, envelopes) in due {
            for envelope in envelopes {
                if let Some(peer) = self.peers.get_mut(&envelope.target) {
                    peer.core_mut().push_inbound(envelope);
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Step every non-terminated participant once, in registry order, then
    /// run the end-of-round aggregation.
    pub fn step_all(&mut self) -> Result<(), SimError> {
        if !self.initialized {
            return Err(SimError::NotInitialized);
        }

        let round = self.round;
        for peer in self.peers.values_mut() {
            if peer.terminated() {
                continue;
            }
            peer.perform_computation(round, &mut self.rng)?;
        }

        let refs: Vec<&P> = self.peers.values().collect();
        if let Some(sample) = P::end_of_round(&refs, round) {
            self.throughput.push(sample);
        }
        Ok(())
    }

    /// Schedule everything produced this round and advance to the next round.
    /// Returns the number of envelopes scheduled.
    pub fn flush(&mut self) -> usize {
        let mut outgoing = Vec::new();
        for peer in self.peers.values_mut() {
            outgoing.extend(peer.core_mut().take_outbound());
        }

        let count = outgoing.len();
        for mut envelope in outgoing {
            envelope.id = self.next_envelope_id;
            self.next_envelope_id += 1;
            self.send(envelope);
        }

        self.round += 1;
        count
    }

    pub fn run_round(&mut self) -> Result<(), SimError> {
        self.deliver();
        self.step_all()?;
        self.flush();
        Ok(())
    }

    /// Place a client request straight into one participant's inbound queue
    pub fn inject(&mut self, target: PeerId, payload: P::Message) -> Result<(), SimError> {
        self.push_request(target, payload)?;
        self.total_requests += 1;
        Ok(())
    }

    /// Place one client request into every participant's inbound queue
    pub fn inject_all(&mut self, payload: P::Message) -> Result<(), SimError> {
        if self.peers.is_empty() {
            return Err(SimError::EmptyNetwork);
        }
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.push_request(id, payload.clone())?;
        }
        self.total_requests += 1;
        Ok(())
    }

    fn push_request(&mut self, target: PeerId, payload: P::Message) -> Result<(), SimError> {
        let id = self.next_envelope_id;
        let round = self.round;
        let peer = self
            .peers
            .get_mut(&target)
            .ok_or(SimError::UnknownPeer(target))?;

        let mut envelope = Envelope::new(CLIENT_ID, target, payload);
        envelope.id = id;
        envelope.delivery_round = round;
        peer.core_mut().push_inbound(envelope);
        self.next_envelope_id += 1;
        Ok(())
    }

    // ============================================================================
    // Fault Injection
    // ============================================================================

    pub fn set_byzantine(&mut self, ids: &[PeerId], flag: bool) -> Result<(), SimError> {
        for id in ids {
            let peer = self.peers.get_mut(id).ok_or(SimError::UnknownPeer(*id))?;
            peer.core_mut().set_byzantine(flag);

            let listed = self.byzantine_order.contains(id);
            if flag && !listed {
                self.byzantine_order.push(*id);
            } else if !flag && listed {
                self.byzantine_order.retain(|b| b != id);
            }
        }
        Ok(())
    }

    /// Flag `count` honest participants as Byzantine, non-leaders first, then
    /// revert the longest-flagged ones until the population is back within
    /// bounds. The population never drops below what it was before the call.
    /// Returns the newly flagged ids.
    pub fn shuffle_byzantine(&mut self, count: usize) -> Vec<PeerId> {
        let before = self.byzantine_order.len();

        let mut honest: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| !p.core().is_byzantine())
            .map(|p| p.id())
            .collect();
        honest.shuffle(&mut self.rng);
        // stable: keeps the shuffled order within leaders / non-leaders
        honest.sort_by_key(|id| self.peers.get(id).map_or(false, |p| p.is_leader()));

        let picked: Vec<PeerId> = honest.into_iter().take(count).collect();
        for id in &picked {
            if let Some(peer) = self.peers.get_mut(id) {
                peer.core_mut().set_byzantine(true);
            }
            self.byzantine_order.push(*id);
        }

        let bound = self.byzantine_bound.max(before);
        while self.byzantine_order.len() > bound {
            let reverted = self.byzantine_order.remove(0);
            if let Some(peer) = self.peers.get_mut(&reverted) {
                peer.core_mut().set_byzantine(false);
            }
        }

        info!(
            "round {}: byzantine reshuffle flagged {:?}, roster {:?}",
            self.round, picked, self.byzantine_order
        );
        picked
            .into_iter()
            .filter(|id| self.byzantine_order.contains(id))
            .collect()
    }

    /// Crash participants: they stay addressable but go inert
    pub fn crash(&mut self, ids: &[PeerId]) -> Result<(), SimError> {
        for id in ids {
            let peer = self.peers.get_mut(id).ok_or(SimError::UnknownPeer(*id))?;
            peer.core_mut().set_crashed(true);
            info!("round {}: participant {} crashed", self.round, id);
        }
        Ok(())
    }

    pub fn rotate_leader(&mut self) {
        for peer in self.peers.values_mut() {
            peer.rotate_leader();
        }
    }

    // ============================================================================
    // Metrics
    // ============================================================================

    pub fn metrics(&self) -> RunMetrics {
        let ledgers = self.peers.values().map(|p| p.ledger_len());
        RunMetrics {
            rounds: self.round,
            min_ledger: ledgers.clone().min().unwrap_or(0),
            max_ledger: ledgers.max().unwrap_or(0),
            total_messages: self.total_messages,
            total_requests: self.total_requests,
            throughput: self.throughput.clone(),
            total_latency: self.peers.values().map(|p| p.latency_total()).sum(),
            total_confirmed: self.peers.values().map(|p| p.ledger_len()).sum(),
        }
    }

    // ============================================================================
    // Accessors
    // ============================================================================

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peer(&self, id: &PeerId) -> Option<&P> {
        self.peers.get(id)
    }

    pub fn peer_mut(&mut self, id: &PeerId) -> Option<&mut P> {
        self.peers.get_mut(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &P> {
        self.peers.values()
    }

    /// Participant at a registry position
    pub fn peer_at(&self, index: usize) -> Option<&P> {
        self.peers.get_index(index).map(|(_, p)| p)
    }

    pub fn byzantine_ids(&self) -> &[PeerId] {
        &self.byzantine_order
    }

    pub fn byzantine_bound(&self) -> usize {
        self.byzantine_bound
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.peers.values().find(|p| p.is_leader()).map(|p| p.id())
    }

    /// Envelopes in flight
    pub fn pending_deliveries(&self) -> usize {
        self.schedule.values().map(|v| v.len()).sum()
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft_echo::EchoPeer;

    fn echo_network(n: u64, delay: DelayModel) -> Network<EchoPeer> {
        let config = SimConfig {
            participant_count: n as usize,
            delay,
            seed: Some([7u8; 32]),
            ..SimConfig::default()
        };
        let mut network = Network::new(config);
        for id in 0..n {
            network.add_peer(EchoPeer::new(id)).unwrap();
        }
        network
    }

    #[test]
    fn test_quorum_size_examples() {
        assert_eq!(quorum_size(4, 0.25), 2);
        assert_eq!(quorum_size(10, 0.3), 4);
        assert_eq!(quorum_size(7, 0.3), 4);
        assert_eq!(quorum_size(1, 1.0), 1);
        assert_eq!(quorum_size(0, 0.3), 0);
        assert_eq!(quorum_size(5, 0.0), 1);
    }

    #[test]
    fn test_quorum_size_monotone_and_bounded() {
        let fractions: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();
        for n in 0..60 {
            for w in fractions.windows(2) {
                assert!(quorum_size(n, w[0]) <= quorum_size(n, w[1]));
            }
            for f in &fractions {
                assert!(quorum_size(n, *f) <= n);
                assert!(quorum_size(n, *f) <= quorum_size(n + 1, *f));
            }
        }
    }

    #[test]
    fn test_quorum_size_float_tolerance() {
        // 10 * 0.3 evaluates just above 3
        assert_eq!(quorum_size(10, 0.3), 4);
        assert_eq!(quorum_size(3, 1.0 / 3.0), 2);
        assert_eq!(quorum_size(3, 1.0 / 3.0 + 1e-12), 2);
        assert_eq!(quorum_size(3, 1.0 / 3.0 + 1e-6), 3);
    }

    #[test]
    fn test_huge_fixed_delay_saturates() {
        let mut network = echo_network(2, DelayModel::Fixed { rounds: Round::MAX });
        network.init().unwrap();

        for _ in 0..3 {
            network.run_round().unwrap();
        }

        assert_eq!(network.pending_deliveries(), 6);
        assert!(network.peers().all(|p| p.received().is_empty()));
    }

    #[test]
    fn test_empty_network_is_fatal() {
        let mut network: Network<EchoPeer> = Network::new(SimConfig::default());
        assert!(matches!(network.init(), Err(SimError::EmptyNetwork)));
    }

    #[test]
    fn test_step_before_init_is_rejected() {
        let mut network = echo_network(3, DelayModel::default());
        assert!(matches!(network.step_all(), Err(SimError::NotInitialized)));
        assert!(matches!(network.run_round(), Err(SimError::NotInitialized)));
    }

    #[test]
    fn test_duplicate_and_late_registration() {
        let mut network = echo_network(2, DelayModel::default());
        assert!(matches!(
            network.add_peer(EchoPeer::new(1)),
            Err(SimError::DuplicatePeer(1))
        ));
        network.init().unwrap();
        assert!(matches!(
            network.add_peer(EchoPeer::new(9)),
            Err(SimError::AlreadyInitialized)
        ));
        assert!(matches!(network.init(), Err(SimError::AlreadyInitialized)));
    }

    #[test]
    fn test_init_connects_everyone() {
        let mut network = echo_network(4, DelayModel::default());
        network.init().unwrap();
        for peer in network.peers() {
            assert_eq!(peer.core().neighbors().len(), 3);
            assert!(!peer.core().is_neighbor(&peer.id()));
        }
    }

    #[test]
    fn test_round_barrier() {
        let mut network = echo_network(5, DelayModel::Fixed { rounds: 1 });
        network.init().unwrap();

        for _ in 0..6 {
            network.run_round().unwrap();
        }

        for peer in network.peers() {
            assert!(!peer.received().is_empty());
            for (received_at, message) in peer.received() {
                assert!(message.round < *received_at);
            }
        }
    }

    #[test]
    fn test_zero_delay_still_waits_a_round() {
        let mut network = echo_network(3, DelayModel::Fixed { rounds: 0 });
        network.init().unwrap();

        network.run_round().unwrap();
        assert!(network.peers().all(|p| p.received().is_empty()));
        assert_eq!(network.pending_deliveries(), 6);

        network.run_round().unwrap();
        for peer in network.peers() {
            assert_eq!(peer.received().len(), 2);
            assert!(peer.received().iter().all(|(at, m)| *at == 1 && m.round == 0));
        }
    }

    #[test]
    fn test_fixed_delay_schedules_ahead() {
        let mut network = echo_network(2, DelayModel::Fixed { rounds: 3 });
        network.init().unwrap();

        for _ in 0..4 {
            network.run_round().unwrap();
        }

        let peer = network.peer(&0).unwrap();
        assert_eq!(peer.received().len(), 1);
        assert_eq!(peer.received()[0].0, 3);
        assert_eq!(peer.received()[0].1.round, 0);
    }

    #[test]
    fn test_each_participant_steps_once_per_round() {
        let mut network = echo_network(4, DelayModel::Uniform { min: 1, max: 3 });
        network.init().unwrap();

        for _ in 0..10 {
            network.run_round().unwrap();
        }

        assert_eq!(network.round(), 10);
        assert!(network.peers().all(|p| p.steps() == 10));
        assert_eq!(network.metrics().throughput.len(), 10);
    }

    #[test]
    fn test_unknown_target_is_dropped() {
        let mut network = echo_network(2, DelayModel::default());
        network.init().unwrap();
        let message = network.peer(&0).unwrap().greeting(0);

        network.send(Envelope::new(0, 42, message));

        assert_eq!(network.pending_deliveries(), 0);
        assert_eq!(network.metrics().total_messages, 0);
    }

    #[test]
    fn test_inject_reaches_inbound_immediately() {
        let mut network = echo_network(3, DelayModel::Fixed { rounds: 5 });
        network.init().unwrap();
        let message = network.peer(&0).unwrap().greeting(0);

        network.inject_all(message.clone()).unwrap();
        network.run_round().unwrap();

        for peer in network.peers() {
            assert_eq!(peer.received().len(), 1);
            assert_eq!(peer.received()[0].0, 0);
        }
        assert_eq!(network.metrics().total_requests, 1);
        assert!(matches!(
            network.inject(77, message),
            Err(SimError::UnknownPeer(77))
        ));
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let run = || {
            let mut network = echo_network(4, DelayModel::Poisson { lambda: 2.0 });
            network.init().unwrap();
            for _ in 0..15 {
                network.run_round().unwrap();
            }
            network.metrics()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_crashed_participant_stays_addressable() {
        let mut network = echo_network(3, DelayModel::default());
        network.init().unwrap();
        network.crash(&[2]).unwrap();

        for _ in 0..3 {
            network.run_round().unwrap();
        }

        let crashed = network.peer(&2).unwrap();
        assert_eq!(crashed.core().messages_sent(), 0);
        assert!(crashed.received().is_empty());
        // the others still greet it every round
        assert_eq!(network.peer(&0).unwrap().core().messages_sent(), 6);
        assert!(matches!(network.crash(&[9]), Err(SimError::UnknownPeer(9))));
    }

    #[test]
    fn test_set_byzantine_tracks_roster() {
        let mut network = echo_network(4, DelayModel::default());
        network.init().unwrap();

        network.set_byzantine(&[1, 3], true).unwrap();
        assert_eq!(network.byzantine_ids(), &[1, 3]);
        assert!(network.peer(&3).unwrap().core().is_byzantine());

        network.set_byzantine(&[1], false).unwrap();
        assert_eq!(network.byzantine_ids(), &[3]);
        assert!(matches!(
            network.set_byzantine(&[8], true),
            Err(SimError::UnknownPeer(8))
        ));
    }

    #[test]
    fn test_shuffle_keeps_population_and_avoids_leader() {
        // 10 peers, fault fraction 0.3 -> bound of 3
        let config = SimConfig {
            participant_count: 10,
            fault_fraction: 0.3,
            seed: Some([3u8; 32]),
            ..SimConfig::default()
        };
        let mut network = Network::new(config);
        for id in 0..10 {
            network.add_peer(EchoPeer::new(id)).unwrap();
        }
        network.init().unwrap();
        assert_eq!(network.leader(), Some(0));

        network.set_byzantine(&[4, 5, 6], true).unwrap();
        for _ in 0..20 {
            let before = network.byzantine_ids().len();
            let flipped = network.shuffle_byzantine(2);

            assert!(network.byzantine_ids().len() >= before);
            assert_eq!(network.byzantine_ids().len(), 3);
            assert_eq!(flipped.len(), 2);
            assert!(!network.peer(&0).unwrap().core().is_byzantine());

            let flagged = network.peers().filter(|p| p.core().is_byzantine()).count();
            assert_eq!(flagged, 3);
        }
    }

    #[test]
    fn test_shuffle_grows_up_to_bound() {
        let config = SimConfig {
            participant_count: 10,
            fault_fraction: 0.3,
            seed: Some([4u8; 32]),
            ..SimConfig::default()
        };
        let mut network = Network::new(config);
        for id in 0..10 {
            network.add_peer(EchoPeer::new(id)).unwrap();
        }
        network.init().unwrap();

        network.shuffle_byzantine(2);
        assert_eq!(network.byzantine_ids().len(), 2);
        network.shuffle_byzantine(2);
        assert_eq!(network.byzantine_ids().len(), 3);
    }

    #[test]
    fn test_metrics_report_ledgers() {
        let mut network = echo_network(3, DelayModel::default());
        network.init().unwrap();
        network.crash(&[1]).unwrap();
        for _ in 0..4 {
            network.run_round().unwrap();
        }

        let metrics = network.metrics();
        assert_eq!(metrics.rounds, 4);
        assert_eq!(metrics.min_ledger, 0);
        assert_eq!(metrics.max_ledger, 3);
        // two live peers, two neighbors each, four rounds
        assert_eq!(metrics.total_messages, 16);
    }
}
