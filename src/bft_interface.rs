use std::collections::{BTreeSet, VecDeque};
use std::fmt::Debug;

use rand::rngs::StdRng;

use crate::bft_config::SimConfig;
use crate::bft_error::SimError;

// all the same numeric type to allow casting/interop
pub type PeerId = u64;
pub type Round = u64;
pub type View = u64;
pub type Sequence = u64;
pub type TransactionId = u64;
pub type EnvelopeId = u64;

/// Source id used for requests injected by the driver (the "client")
pub const CLIENT_ID: PeerId = u64::MAX;

/// One protocol message in flight between two participants.
///
/// The transport stamps `id` and `delivery_round` when the envelope leaves the
/// sender's outbound queue; from then on it is owned by the transport until it
/// lands in the target's inbound queue.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<M> {
    pub id: EnvelopeId,
    pub source: PeerId,
    pub target: PeerId,
    pub payload: M,
    pub delivery_round: Round,
}

impl<M> Envelope<M> {
    pub fn new(source: PeerId, target: PeerId, payload: M) -> Self {
        Self {
            id: 0,
            source,
            target,
            payload,
            delivery_round: 0,
        }
    }
}

/// Protocol-agnostic part of a participant: identity, neighbors, queues and
/// fault flags.
///
/// Neighbors are ids, resolved through the transport registry.
#[derive(Clone, Debug)]
pub struct PeerCore<M> {
    id: PeerId,
    neighbors: BTreeSet<PeerId>,
    inbound: VecDeque<Envelope<M>>,
    outbound: Vec<Envelope<M>>,
    byzantine: bool,
    crashed: bool,
    messages_sent: usize,
}

impl<M> PeerCore<M> {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            neighbors: BTreeSet::new(),
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            byzantine: false,
            crashed: false,
            messages_sent: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn neighbors(&self) -> &BTreeSet<PeerId> {
        &self.neighbors
    }

    pub fn add_neighbor(&mut self, peer: PeerId) {
        if peer != self.id {
            self.neighbors.insert(peer);
        }
    }

    pub fn set_neighbors<I: IntoIterator<Item = PeerId>>(&mut self, peers: I) {
        self.neighbors.clear();
        for peer in peers {
            self.add_neighbor(peer);
        }
    }

    pub fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.neighbors.contains(peer)
    }

    /// Queue a message for a single target
    pub fn send(&mut self, target: PeerId, payload: M) {
        self.messages_sent += 1;
        self.outbound.push(Envelope::new(self.id, target, payload));
    }

    /// Queue one envelope per neighbor, in neighbor order
    pub fn broadcast(&mut self, payload: M)
    where
        M: Clone,
    {
        let targets: Vec<PeerId> = self.neighbors.iter().copied().collect();
        for target in targets {
            self.send(target, payload.clone());
        }
    }

    pub fn pop_inbound(&mut self) -> Option<Envelope<M>> {
        self.inbound.pop_front()
    }

    /// Take the whole inbound snapshot in arrival order
    pub fn drain_inbound(&mut self) -> Vec<Envelope<M>> {
        self.inbound.drain(..).collect()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_byzantine(&self) -> bool {
        self.byzantine
    }

    pub fn set_byzantine(&mut self, flag: bool) {
        self.byzantine = flag;
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    pub fn set_crashed(&mut self, flag: bool) {
        self.crashed = flag;
    }

    /// Envelopes produced over the lifetime of this participant
    pub fn messages_sent(&self) -> usize {
        self.messages_sent
    }

    pub(crate) fn push_inbound(&mut self, envelope: Envelope<M>) {
        self.inbound.push_back(envelope);
    }

    pub(crate) fn take_outbound(&mut self) -> Vec<Envelope<M>> {
        std::mem::take(&mut self.outbound)
    }
}

/// A protocol participant driven by the transport in discrete rounds.
///
/// The transport calls `init_parameters` once over the full participant set
/// before round 0, then every round: `perform_computation` on each participant
/// (in registry order) followed by a single `end_of_round` over all of them.
pub trait Participant: Sized {
    type Message: Clone + Debug + PartialEq;

    fn core(&self) -> &PeerCore<Self::Message>;

    fn core_mut(&mut self) -> &mut PeerCore<Self::Message>;

    fn id(&self) -> PeerId {
        self.core().id()
    }

    /// Wire shared per-run configuration across the whole participant set.
    fn init_parameters(
        peers: &mut [&mut Self],
        config: &SimConfig,
        rng: &mut StdRng,
    ) -> Result<(), SimError>;

    /// One step of the protocol: consume the inbound queue, fill the outbound
    /// queue.
    fn perform_computation(&mut self, round: Round, rng: &mut StdRng) -> Result<(), SimError>;

    /// Cross-participant aggregation after everyone stepped. Returns a
    /// throughput sample for the round, if the protocol has one.
    fn end_of_round(_peers: &[&Self], _round: Round) -> Option<usize> {
        None
    }

    fn is_leader(&self) -> bool {
        false
    }

    /// Hand leadership to the next participant in rotation
    fn rotate_leader(&mut self) {}

    /// Length of the confirmed log, used by the run metrics
    fn ledger_len(&self) -> usize {
        0
    }

    /// Sum of confirmation latencies (rounds) over the confirmed log
    fn latency_total(&self) -> Round {
        0
    }

    /// A terminated participant is no longer stepped
    fn terminated(&self) -> bool {
        false
    }
}

// ============================================================================
// Event Logging System
// ============================================================================

/// Events emitted by consensus participants for debugging and analysis
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Leader proposed a transaction
    PrePrepareSent {
        view: View,
        sequence: Sequence,
        transaction: TransactionId,
    },
    /// Follower accepted a proposal
    PrepareSent {
        view: View,
        sequence: Sequence,
        transaction: TransactionId,
    },
    /// Prepare quorum reached, commit broadcast
    CommitSent {
        view: View,
        sequence: Sequence,
        transaction: TransactionId,
    },
    /// Commit quorum reached, transaction appended to the ledger
    Confirmed {
        view: View,
        sequence: Sequence,
        transaction: TransactionId,
        latency: Round,
    },
    ViewChangeSent {
        target_view: View,
    },
    NewViewSent {
        view: View,
    },
    ViewAdopted {
        from: View,
        to: View,
    },
    Crashed,
}

/// Trait for consuming events from the consensus participants
pub trait EventSink {
    fn log(&mut self, round: Round, peer: PeerId, event: Event);
}

/// No-op event sink (zero overhead)
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn log(&mut self, _round: Round, _peer: PeerId, _event: Event) {}
}

/// Forwards events to the `log` facade at debug level
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn log(&mut self, round: Round, peer: PeerId, event: Event) {
        match event {
            Event::ViewChangeSent { target_view } => {
                log::info!("{} p:{} view-change -> {}", round, peer, target_view)
            }
            Event::ViewAdopted { from, to } => {
                log::info!("{} p:{} view {} -> {}", round, peer, from, to)
            }
            Event::Crashed => log::info!("{} p:{} crashed", round, peer),
            other => log::debug!("{} p:{} {:?}", round, peer, other),
        }
    }
}
