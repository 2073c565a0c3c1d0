//! Committees: the participant set split into fixed-size groups.
//!
//! Every group is its own `Network` with its own rng and schedule, so groups
//! share no state and never exchange envelopes. The container advances all
//! groups in lockstep and sums their metrics.

use hashbrown::HashMap;

use crate::bft_config::SimConfig;
use crate::bft_error::SimError;
use crate::bft_interface::{Participant, PeerId, Round};
use crate::bft_metrics::RunMetrics;
use crate::bft_network::Network;

/// Seed of one group, derived from the run seed
fn group_seed(seed: [u8; 32], group: usize) -> [u8; 32] {
    let mut head = [0u8; 8];
    head.copy_from_slice(&seed[..8]);
    let mixed = u64::from_le_bytes(head)
        .wrapping_add(group as u64)
        .wrapping_mul(0x517cc1b727220a95);

    let mut derived = seed;
    derived[..8].copy_from_slice(&mixed.to_le_bytes());
    derived
}

pub struct Committees<P: Participant> {
    groups: Vec<Network<P>>,
    membership: HashMap<PeerId, usize>,
    group_size: usize,
    seed: [u8; 32],
}

impl<P: Participant> Committees<P> {
    /// Partition `peers`, in the given order, into consecutive groups of
    /// `group_size`. A remainder smaller than `group_size` joins the last group.
    pub fn new(config: SimConfig, peers: Vec<P>, group_size: usize) -> Result<Self, SimError> {
        let seed = config.resolve_seed();
        Self::with_seed(config, peers, group_size, seed)
    }

    pub fn with_seed(
        config: SimConfig,
        peers: Vec<P>,
        group_size: usize,
        seed: [u8; 32],
    ) -> Result<Self, SimError> {
        let participants = peers.len();
        if participants == 0 {
            return Err(SimError::EmptyNetwork);
        }
        if group_size == 0 || group_size > participants {
            return Err(SimError::InvalidGroupSize {
                group_size,
                participants,
            });
        }

        let count = participants / group_size;
        let mut groups: Vec<Network<P>> = (0..count)
            .map(|index| {
                let size = if index + 1 == count {
                    participants - group_size * (count - 1)
                } else {
                    group_size
                };
                let group_config = SimConfig {
                    participant_count: size,
                    ..config.clone()
                };
                Network::with_seed(group_config, group_seed(seed, index))
            })
            .collect();

        let mut membership = HashMap::new();
        for (position, peer) in peers.into_iter().enumerate() {
            let index = (position / group_size).min(count - 1);
            let id = peer.id();
            if membership.insert(id, index).is_some() {
                return Err(SimError::DuplicatePeer(id));
            }
            groups[index].add_peer(peer)?;
        }

        Ok(Self {
            groups,
            membership,
            group_size,
            seed,
        })
    }

    pub fn init(&mut self) -> Result<(), SimError> {
        for group in &mut self.groups {
            group.init()?;
        }
        Ok(())
    }

    pub fn deliver(&mut self) -> usize {
        self.groups.iter_mut().map(|g| g.deliver()).sum()
    }

    pub fn step_all(&mut self) -> Result<(), SimError> {
        for group in &mut self.groups {
            group.step_all()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> usize {
        self.groups.iter_mut().map(|g| g.flush()).sum()
    }

    pub fn run_round(&mut self) -> Result<(), SimError> {
        self.deliver();
        self.step_all()?;
        self.flush();
        Ok(())
    }

    /// Groups advance in lockstep, so any group's round is the round
    pub fn round(&self) -> Round {
        self.groups.first().map_or(0, |g| g.round())
    }

    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn number_of_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn len(&self) -> usize {
        self.membership.len()
    }

    pub fn is_empty(&self) -> bool {
        self.membership.is_empty()
    }

    pub fn group(&self, index: usize) -> Option<&Network<P>> {
        self.groups.get(index)
    }

    pub fn group_mut(&mut self, index: usize) -> Option<&mut Network<P>> {
        self.groups.get_mut(index)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Network<P>> {
        self.groups.iter()
    }

    pub fn group_of(&self, id: &PeerId) -> Option<usize> {
        self.membership.get(id).copied()
    }

    pub fn peer(&self, id: &PeerId) -> Option<&P> {
        self.group_of(id)
            .and_then(|index| self.groups.get(index))
            .and_then(|g| g.peer(id))
    }

    /// Acting leader of one group
    pub fn leader_of(&self, group: usize) -> Option<PeerId> {
        self.groups.get(group).and_then(|g| g.leader())
    }

    /// Hand one group's leadership to its next member
    pub fn rotate_leader(&mut self, group: usize) -> Result<(), SimError> {
        self.groups
            .get_mut(group)
            .ok_or(SimError::UnknownGroup(group))?
            .rotate_leader();
        Ok(())
    }

    pub fn set_byzantine(&mut self, id: PeerId, flag: bool) -> Result<(), SimError> {
        let index = self.group_of(&id).ok_or(SimError::UnknownPeer(id))?;
        self.groups[index].set_byzantine(&[id], flag)
    }

    pub fn crash(&mut self, id: PeerId) -> Result<(), SimError> {
        let index = self.group_of(&id).ok_or(SimError::UnknownPeer(id))?;
        self.groups[index].crash(&[id])
    }

    /// Reshuffle the Byzantine population of every group
    pub fn shuffle_byzantine(&mut self, count: usize) -> Vec<PeerId> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.shuffle_byzantine(count))
            .collect()
    }

    /// Client request for every member of one group
    pub fn inject(&mut self, group: usize, payload: P::Message) -> Result<(), SimError> {
        self.groups
            .get_mut(group)
            .ok_or(SimError::UnknownGroup(group))?
            .inject_all(payload)
    }

    pub fn byzantine_count(&self) -> usize {
        self.groups.iter().map(|g| g.byzantine_ids().len()).sum()
    }

    /// Per-group metrics added up: ledger bounds are sums of per-group bounds
    pub fn metrics(&self) -> RunMetrics {
        let mut total = RunMetrics::default();
        for group in &self.groups {
            total.merge(&group.metrics());
        }
        total
    }
}
