//! PBFT consensus engine.
//!
//! Per sequence number a participant moves pre-prepare -> prepare -> commit.
//! Quorums are counted over distinct senders whose message matches the current
//! (view, sequence, transaction); the leader's pre-prepare stands in for its
//! prepare vote.
//!
//! A follower with outstanding work that makes no progress for
//! `timeout_rounds` asks for the next view and pauses. While paused it only
//! acts on view-change traffic; a view change that stays unanswered escalates
//! to the following view after `k × timeout_rounds` for a jump of `k` views.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use hashbrown::HashSet;
use log::warn;
use rand::rngs::StdRng;
use rand::Rng;

use crate::bft_config::SimConfig;
use crate::bft_error::SimError;
use crate::bft_interface::{
    Event, EventSink, NoOpSink, Participant, PeerCore, PeerId, Round, Sequence, TransactionId,
    View, CLIENT_ID,
};
use crate::bft_network::quorum_size;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PrePrepare,
    Prepare,
    Commit,
    /// A client request (or a self-submitted one) entering the system
    Submit,
    ViewChange,
    NewView,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    PrePrepare,
    Prepare,
    Commit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Add,
    Subtract,
    Unknown(u8),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub code: OpCode,
    pub operands: Vec<i64>,
}

impl Operation {
    pub fn new(code: OpCode, operands: Vec<i64>) -> Self {
        Self { code, operands }
    }

    pub fn add(a: i64, b: i64) -> Self {
        Self::new(OpCode::Add, vec![a, b])
    }

    pub fn subtract(a: i64, b: i64) -> Self {
        Self::new(OpCode::Subtract, vec![a, b])
    }

    /// Apply the operation. An unrecognized code is not an error: it is logged
    /// and yields 0.
    pub fn execute(&self) -> i64 {
        match self.code {
            OpCode::Add => self.operands.iter().fold(0i64, |acc, x| acc.wrapping_add(*x)),
            OpCode::Subtract => match self.operands.split_first() {
                Some((first, rest)) => rest.iter().fold(*first, |acc, x| acc.wrapping_sub(*x)),
                None => 0,
            },
            OpCode::Unknown(code) => {
                warn!("unknown operation code {}, result defaults to 0", code);
                0
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub operation: Operation,
    pub round_submitted: Round,
}

impl Transaction {
    pub fn new(id: TransactionId, operation: Operation, round_submitted: Round) -> Self {
        Self {
            id,
            operation,
            round_submitted,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PbftMessage {
    pub sender: PeerId,
    pub kind: MessageKind,
    pub transaction: Option<Transaction>,
    pub sequence: Sequence,
    pub view: View,
    pub round_submitted: Round,
}

impl PbftMessage {
    /// Client request carrying `transaction`
    pub fn request(transaction: Transaction) -> Self {
        Self {
            sender: CLIENT_ID,
            kind: MessageKind::Submit,
            sequence: 0,
            view: 0,
            round_submitted: transaction.round_submitted,
            transaction: Some(transaction),
        }
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }
}

/// One entry of a participant's confirmed log
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmedTransaction {
    pub transaction: Transaction,
    pub sequence: Sequence,
    pub view: View,
    /// Round the commit quorum was reached
    pub round: Round,
    pub result: i64,
}

/// State shared by every member of one PBFT instance.
///
/// Created once in `init_parameters`; only the acting leader mutates it (the
/// transaction counter), always from inside its own step.
#[derive(Debug)]
pub struct PbftRun {
    members: Vec<PeerId>,
    quorum: usize,
    timeout: Round,
    self_submit: bool,
    next_transaction: TransactionId,
}

impl PbftRun {
    pub fn new(mut members: Vec<PeerId>, config: &SimConfig) -> Self {
        members.sort_unstable();
        members.dedup();
        Self {
            quorum: quorum_size(members.len(), config.fault_fraction),
            members,
            timeout: config.timeout_rounds,
            self_submit: config.self_submit,
            next_transaction: 1,
        }
    }

    /// Members in view order
    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn timeout(&self) -> Round {
        self.timeout
    }

    /// Leader of `view`: `members[view mod n]`
    pub fn leader_of(&self, view: View) -> Option<PeerId> {
        if self.members.is_empty() {
            return None;
        }
        let index = (view % self.members.len() as u64) as usize;
        self.members.get(index).copied()
    }

    /// Next id of the instance-wide transaction counter. Client requests and
    /// leader-generated transactions both draw from it.
    pub fn next_transaction_id(&mut self) -> TransactionId {
        let id = self.next_transaction;
        self.next_transaction += 1;
        id
    }
}

/// Rounds until a crash candidate fails, drawn once per run
fn sample_crash_round(rate: f64, horizon: Round, rng: &mut StdRng) -> Option<Round> {
    if rate >= 1.0 {
        return Some(0);
    }
    if rate.is_nan() || rate <= 0.0 {
        return None;
    }
    (0..horizon).find(|_| rng.gen_bool(rate))
}

pub struct PbftPeer {
    core: PeerCore<PbftMessage>,
    run: Option<Rc<RefCell<PbftRun>>>,

    phase: Phase,
    sequence: Sequence,
    view: View,
    candidate: Option<PeerId>,

    // view change
    timer: Round,
    paused: bool,
    target_view: View,

    // Buffers
    pending: BTreeMap<Sequence, Vec<PbftMessage>>,
    view_changes: BTreeMap<View, Vec<PbftMessage>>,
    transactions: Vec<Transaction>,
    confirmed_ids: HashSet<TransactionId>,

    // transaction accepted at the current sequence
    prepared: Option<Transaction>,
    // carried over a view change, proposed first by the new leader
    reproposal: Option<Transaction>,
    last_generated: Option<Round>,

    ledger: Vec<ConfirmedTransaction>,
    latency: Round,
    crash_round: Option<Round>,

    event_sink: Box<dyn EventSink>,
}

impl PbftPeer {
    /// Create a participant with default NoOpSink (zero overhead)
    pub fn new(id: PeerId) -> Self {
        Self::new_with_sink(id, Box::new(NoOpSink))
    }

    /// Create a participant with a custom event sink for debugging/analysis
    pub fn new_with_sink(id: PeerId, event_sink: Box<dyn EventSink>) -> Self {
        Self {
            core: PeerCore::new(id),
            run: None,
            phase: Phase::PrePrepare,
            sequence: 0,
            view: 0,
            candidate: None,
            timer: 0,
            paused: false,
            target_view: 0,
            pending: BTreeMap::new(),
            view_changes: BTreeMap::new(),
            transactions: Vec::new(),
            confirmed_ids: HashSet::new(),
            prepared: None,
            reproposal: None,
            last_generated: None,
            ledger: Vec::new(),
            latency: 0,
            crash_round: None,
            event_sink,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn timer(&self) -> Round {
        self.timer
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// View this participant asked to move to (equals `view()` when not paused)
    pub fn target_view(&self) -> View {
        self.target_view
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.leader_of(self.view)
    }

    pub fn candidate_id(&self) -> Option<PeerId> {
        self.candidate
    }

    pub fn ledger(&self) -> &[ConfirmedTransaction] {
        &self.ledger
    }

    /// Known transactions not yet confirmed
    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Protocol messages held for sequence numbers not yet confirmed
    pub fn buffered_messages(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    pub fn crash_round(&self) -> Option<Round> {
        self.crash_round
    }

    pub fn run(&self) -> Option<&Rc<RefCell<PbftRun>>> {
        self.run.as_ref()
    }

    fn leader_of(&self, view: View) -> Option<PeerId> {
        self.run.as_ref().and_then(|run| run.borrow().leader_of(view))
    }

    fn quorum(&self) -> usize {
        self.run.as_ref().map_or(usize::MAX, |run| run.borrow().quorum())
    }

    fn timeout(&self) -> Round {
        self.run.as_ref().map_or(Round::MAX, |run| run.borrow().timeout())
    }

    fn self_submit(&self) -> bool {
        self.run.as_ref().map_or(false, |run| run.borrow().self_submit)
    }

    /// A follower expects progress when it knows an unconfirmed transaction,
    /// is mid-instance, or serves a self-submitting leader that always owes
    /// the next proposal.
    fn has_outstanding_work(&self) -> bool {
        self.phase != Phase::PrePrepare || !self.transactions.is_empty() || self.self_submit()
    }

    // ============================================================================
    // Inbound
    // ============================================================================

    fn receive(&mut self) {
        for envelope in self.core.drain_inbound() {
            let message = envelope.payload;
            match message.kind {
                MessageKind::Submit => {
                    if let Some(transaction) = message.transaction {
                        self.track(transaction);
                    }
                }
                MessageKind::ViewChange | MessageKind::NewView => {
                    if message.view > self.view {
                        let bucket = self.view_changes.entry(message.view).or_default();
                        if !bucket.contains(&message) {
                            bucket.push(message);
                        }
                    }
                }
                MessageKind::PrePrepare | MessageKind::Prepare | MessageKind::Commit => {
                    // confirmed sequence or abandoned view
                    if message.sequence < self.sequence || message.view < self.view {
                        continue;
                    }
                    self.buffer(message);
                }
            }
        }
    }

    fn track(&mut self, transaction: Transaction) {
        if self.confirmed_ids.contains(&transaction.id)
            || self.transactions.iter().any(|t| t.id == transaction.id)
        {
            return;
        }
        self.transactions.push(transaction);
    }

    fn buffer(&mut self, message: PbftMessage) {
        let bucket = self.pending.entry(message.sequence).or_default();
        if !bucket.contains(&message) {
            bucket.push(message);
        }
    }

    // ============================================================================
    // View Change
    // ============================================================================

    fn process_view_traffic(&mut self, round: Round) {
        // highest valid new-view wins
        let adoptable = self.view_changes.iter().rev().find_map(|(view, messages)| {
            let announced = messages
                .iter()
                .any(|m| m.kind == MessageKind::NewView && Some(m.sender) == self.leader_of(*view));
            (announced && (!self.paused || *view >= self.target_view)).then_some(*view)
        });
        if let Some(view) = adoptable {
            self.adopt_view(view, round);
        }

        // join a view change a quorum already asked for
        let quorum = self.quorum();
        let floor = if self.paused { self.target_view } else { self.view };
        let joined = self
            .view_changes
            .keys()
            .rev()
            .find(|view| **view > floor && self.view_change_votes(**view) >= quorum)
            .copied();
        if let Some(view) = joined {
            self.start_view_change(view, round);
        }

        if self.paused
            && self.leader_of(self.target_view) == Some(self.core.id())
            && self.view_change_votes(self.target_view) >= quorum
        {
            self.announce_new_view(round);
        }
    }

    fn view_change_votes(&self, view: View) -> usize {
        let senders: HashSet<PeerId> = self
            .view_changes
            .get(&view)
            .into_iter()
            .flatten()
            .filter(|m| m.kind == MessageKind::ViewChange)
            .map(|m| m.sender)
            .collect();
        senders.len()
    }

    fn start_view_change(&mut self, target: View, round: Round) {
        self.paused = true;
        self.target_view = target;
        self.timer = 0;
        self.candidate = self.leader_of(target);

        let message = PbftMessage {
            sender: self.core.id(),
            kind: MessageKind::ViewChange,
            transaction: self.prepared.clone(),
            sequence: self.sequence,
            view: target,
            round_submitted: round,
        };
        let bucket = self.view_changes.entry(target).or_default();
        if !bucket.contains(&message) {
            bucket.push(message.clone());
        }
        self.core.broadcast(message);
        self.event_sink.log(
            round,
            self.core.id(),
            Event::ViewChangeSent {
                target_view: target,
            },
        );
    }

    fn announce_new_view(&mut self, round: Round) {
        let view = self.target_view;
        let carried = self
            .view_changes
            .get(&view)
            .into_iter()
            .flatten()
            .filter(|m| m.kind == MessageKind::ViewChange && m.sequence == self.sequence)
            .find_map(|m| m.transaction.clone())
            .filter(|t| !self.confirmed_ids.contains(&t.id));

        self.core.broadcast(PbftMessage {
            sender: self.core.id(),
            kind: MessageKind::NewView,
            transaction: None,
            sequence: self.sequence,
            view,
            round_submitted: round,
        });
        self.event_sink
            .log(round, self.core.id(), Event::NewViewSent { view });

        self.adopt_view(view, round);
        self.reproposal = carried;
    }

    fn adopt_view(&mut self, view: View, round: Round) {
        let from = self.view;
        self.enter_view(view);
        self.event_sink
            .log(round, self.core.id(), Event::ViewAdopted { from, to: view });
    }

    fn enter_view(&mut self, view: View) {
        self.view = view;
        self.target_view = view;
        self.paused = false;
        self.timer = 0;
        self.phase = Phase::PrePrepare;
        self.reproposal = None;
        self.candidate = self.leader_of(view + 1);
        self.view_changes = self.view_changes.split_off(&(view + 1));
    }

    fn tick_timer(&mut self, round: Round) {
        let timeout = self.timeout();
        if self.paused {
            // v+1: 1T, v+2: 2T, ...
            let jump = self.target_view.saturating_sub(self.view).max(1);
            if self.timer >= jump.saturating_mul(timeout) {
                self.start_view_change(self.target_view + 1, round);
            } else {
                self.timer += 1;
            }
        } else if !self.is_leader() && self.has_outstanding_work() {
            if self.timer >= timeout {
                self.start_view_change(self.view + 1, round);
            } else {
                self.timer += 1;
            }
        }
    }

    // ============================================================================
    // Normal Case
    // ============================================================================

    fn advance(&mut self, round: Round) {
        loop {
            let before = (self.sequence, self.phase);
            self.try_propose(round);
            self.try_accept_proposal(round);
            self.try_prepare_quorum(round);
            self.try_commit_quorum(round);
            if before == (self.sequence, self.phase) {
                break;
            }
        }
    }

    fn try_propose(&mut self, round: Round) {
        if self.phase != Phase::PrePrepare || !self.is_leader() || self.core.is_byzantine() {
            return;
        }
        let next = self
            .reproposal
            .take()
            .or_else(|| self.transactions.first().cloned());
        let transaction = match next {
            Some(transaction) => transaction,
            None if self.self_submit() && self.last_generated != Some(round) => {
                self.generate(round)
            }
            None => return,
        };

        let message = PbftMessage {
            sender: self.core.id(),
            kind: MessageKind::PrePrepare,
            transaction: Some(transaction.clone()),
            sequence: self.sequence,
            view: self.view,
            round_submitted: transaction.round_submitted,
        };
        self.buffer(message.clone());
        self.core.broadcast(message);
        self.phase = Phase::Prepare;
        self.event_sink.log(
            round,
            self.core.id(),
            Event::PrePrepareSent {
                view: self.view,
                sequence: self.sequence,
                transaction: transaction.id,
            },
        );
        self.prepared = Some(transaction);
    }

    /// Leader-side transaction generation
    fn generate(&mut self, round: Round) -> Transaction {
        let id = match &self.run {
            Some(run) => run.borrow_mut().next_transaction_id(),
            None => 0,
        };
        let transaction = Transaction::new(id, Operation::add(id as i64, 1), round);
        self.last_generated = Some(round);
        self.transactions.push(transaction.clone());
        self.core.broadcast(PbftMessage {
            sender: self.core.id(),
            kind: MessageKind::Submit,
            transaction: Some(transaction.clone()),
            sequence: self.sequence,
            view: self.view,
            round_submitted: round,
        });
        transaction
    }

    fn try_accept_proposal(&mut self, round: Round) {
        if self.phase != Phase::PrePrepare || self.is_leader() {
            return;
        }
        let leader = self.leader_of(self.view);
        let proposal = self.pending.get(&self.sequence).and_then(|messages| {
            messages
                .iter()
                .find(|m| {
                    m.kind == MessageKind::PrePrepare
                        && m.view == self.view
                        && Some(m.sender) == leader
                })
                .and_then(|m| m.transaction.clone())
        });
        let transaction = match proposal {
            Some(transaction) if !self.confirmed_ids.contains(&transaction.id) => transaction,
            _ => return,
        };

        self.track(transaction.clone());
        self.phase = Phase::Prepare;
        self.timer = 0;
        self.vote(MessageKind::Prepare, &transaction, round);
        self.event_sink.log(
            round,
            self.core.id(),
            Event::PrepareSent {
                view: self.view,
                sequence: self.sequence,
                transaction: transaction.id,
            },
        );
        self.prepared = Some(transaction);
    }

    fn try_prepare_quorum(&mut self, round: Round) {
        if self.phase != Phase::Prepare {
            return;
        }
        let transaction = match self.prepared.clone() {
            Some(transaction) => transaction,
            None => return,
        };
        let leader = self.leader_of(self.view);
        let votes = self.count_votes(transaction.id, |m| {
            m.kind == MessageKind::Prepare
                || (m.kind == MessageKind::PrePrepare && Some(m.sender) == leader)
        });
        if votes < self.quorum() {
            return;
        }

        self.phase = Phase::Commit;
        self.vote(MessageKind::Commit, &transaction, round);
        self.event_sink.log(
            round,
            self.core.id(),
            Event::CommitSent {
                view: self.view,
                sequence: self.sequence,
                transaction: transaction.id,
            },
        );
    }

    fn try_commit_quorum(&mut self, round: Round) {
        if self.phase != Phase::Commit {
            return;
        }
        let transaction = match self.prepared.clone() {
            Some(transaction) => transaction,
            None => return,
        };
        let votes = self.count_votes(transaction.id, |m| m.kind == MessageKind::Commit);
        if votes >= self.quorum() {
            self.confirm(transaction, round);
        }
    }

    /// Distinct senders of matching messages at the current (view, sequence)
    fn count_votes<F>(&self, transaction: TransactionId, accepts: F) -> usize
    where
        F: Fn(&PbftMessage) -> bool,
    {
        let senders: HashSet<PeerId> = self
            .pending
            .get(&self.sequence)
            .into_iter()
            .flatten()
            .filter(|m| {
                m.view == self.view && m.transaction_id() == Some(transaction) && accepts(m)
            })
            .map(|m| m.sender)
            .collect();
        senders.len()
    }

    /// Record our own vote and broadcast it. A Byzantine participant keeps the
    /// honest vote locally but sends one for a transaction nobody proposed.
    fn vote(&mut self, kind: MessageKind, transaction: &Transaction, round: Round) {
        let honest = PbftMessage {
            sender: self.core.id(),
            kind,
            transaction: Some(transaction.clone()),
            sequence: self.sequence,
            view: self.view,
            round_submitted: round,
        };
        let outgoing = if self.core.is_byzantine() {
            let mut corrupted = honest.clone();
            if let Some(t) = corrupted.transaction.as_mut() {
                t.id = !t.id;
            }
            corrupted
        } else {
            honest.clone()
        };
        self.buffer(honest);
        self.core.broadcast(outgoing);
    }

    fn confirm(&mut self, transaction: Transaction, round: Round) {
        let latency = round.saturating_sub(transaction.round_submitted);
        let result = transaction.operation.execute();
        self.latency += latency;
        self.confirmed_ids.insert(transaction.id);
        self.transactions.retain(|t| t.id != transaction.id);
        self.event_sink.log(
            round,
            self.core.id(),
            Event::Confirmed {
                view: self.view,
                sequence: self.sequence,
                transaction: transaction.id,
                latency,
            },
        );
        self.ledger.push(ConfirmedTransaction {
            transaction,
            sequence: self.sequence,
            view: self.view,
            round,
            result,
        });

        self.pending = self.pending.split_off(&(self.sequence + 1));
        self.sequence += 1;
        self.phase = Phase::PrePrepare;
        self.prepared = None;
        self.timer = 0;
    }
}

impl Participant for PbftPeer {
    type Message = PbftMessage;

    fn core(&self) -> &PeerCore<PbftMessage> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeerCore<PbftMessage> {
        &mut self.core
    }

    /// Builds the shared run state and picks the crash candidates: the first
    /// `crash_count` members in view order, i.e. the next leaders.
    fn init_parameters(
        peers: &mut [&mut Self],
        config: &SimConfig,
        rng: &mut StdRng,
    ) -> Result<(), SimError> {
        if peers.is_empty() {
            return Err(SimError::EmptyNetwork);
        }
        let members: Vec<PeerId> = peers.iter().map(|p| p.id()).collect();
        let run = Rc::new(RefCell::new(PbftRun::new(members, config)));

        let mut crash_rounds: Vec<(PeerId, Round)> = Vec::new();
        let candidates: Vec<PeerId> = run
            .borrow()
            .members()
            .iter()
            .take(config.crash_count)
            .copied()
            .collect();
        for id in candidates {
            if let Some(round) = sample_crash_round(config.crash_rate, config.max_rounds, rng) {
                crash_rounds.push((id, round));
            }
        }

        for peer in peers.iter_mut() {
            let id = peer.id();
            peer.run = Some(Rc::clone(&run));
            peer.candidate = peer.leader_of(peer.view + 1);
            peer.crash_round = crash_rounds
                .iter()
                .find(|(candidate, _)| *candidate == id)
                .map(|(_, round)| *round);
        }
        Ok(())
    }

    fn perform_computation(&mut self, round: Round, _rng: &mut StdRng) -> Result<(), SimError> {
        if self.run.is_none() {
            return Err(SimError::NoPrimary {
                peer: self.core.id(),
            });
        }

        if !self.core.is_crashed() && self.crash_round.map_or(false, |r| round >= r) {
            self.core.set_crashed(true);
            self.event_sink.log(round, self.core.id(), Event::Crashed);
        }
        if self.core.is_crashed() {
            self.core.drain_inbound();
            return Ok(());
        }

        self.receive();
        self.process_view_traffic(round);
        if !self.paused {
            self.advance(round);
        }
        self.tick_timer(round);
        Ok(())
    }

    /// Throughput sample: longest ledger in the instance
    fn end_of_round(peers: &[&Self], _round: Round) -> Option<usize> {
        peers.iter().map(|p| p.ledger.len()).max()
    }

    fn is_leader(&self) -> bool {
        self.leader_of(self.view) == Some(self.core.id())
    }

    fn rotate_leader(&mut self) {
        if self.run.is_some() {
            self.enter_view(self.view + 1);
        }
    }

    fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    fn latency_total(&self) -> Round {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft_delay::DelayModel;
    use crate::bft_interface::Envelope;
    use crate::bft_network::Network;
    use rand::SeedableRng;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<(Round, PeerId, Event)>>>);

    impl EventSink for Recorder {
        fn log(&mut self, round: Round, peer: PeerId, event: Event) {
            self.0.borrow_mut().push((round, peer, event));
        }
    }

    impl Recorder {
        fn rounds_of<F: Fn(&Event) -> bool>(&self, matches: F) -> Vec<(Round, PeerId)> {
            self.0
                .borrow()
                .iter()
                .filter(|(_, _, e)| matches(e))
                .map(|(r, p, _)| (*r, *p))
                .collect()
        }
    }

    fn config(n: usize) -> SimConfig {
        SimConfig {
            participant_count: n,
            fault_fraction: 0.25,
            seed: Some([11u8; 32]),
            ..SimConfig::default()
        }
    }

    fn network(config: SimConfig, recorder: &Recorder) -> Network<PbftPeer> {
        let n = config.participant_count as u64;
        let mut network = Network::new(config);
        for id in 0..n {
            network
                .add_peer(PbftPeer::new_with_sink(id, Box::new(recorder.clone())))
                .unwrap();
        }
        network
    }

    fn request(id: TransactionId, round: Round) -> PbftMessage {
        PbftMessage::request(Transaction::new(id, Operation::add(2, 3), round))
    }

    fn run_rounds(network: &mut Network<PbftPeer>, rounds: u64) {
        for _ in 0..rounds {
            network.run_round().unwrap();
        }
    }

    fn message(sender: PeerId, kind: MessageKind, view: View, sequence: Sequence) -> PbftMessage {
        PbftMessage {
            sender,
            kind,
            transaction: Some(Transaction::new(1, Operation::add(2, 3), 0)),
            sequence,
            view,
            round_submitted: 0,
        }
    }

    #[test]
    fn test_operation_execute() {
        assert_eq!(Operation::add(2, 3).execute(), 5);
        assert_eq!(Operation::subtract(10, 4).execute(), 6);
        assert_eq!(Operation::new(OpCode::Add, vec![1, 2, 3]).execute(), 6);
        assert_eq!(Operation::new(OpCode::Unknown(9), vec![1, 2]).execute(), 0);
    }

    #[test]
    fn test_leader_is_view_mod_n() {
        let run = PbftRun::new(vec![7, 3, 5, 1], &config(4));
        assert_eq!(run.members(), &[1, 3, 5, 7]);
        assert_eq!(run.leader_of(0), Some(1));
        assert_eq!(run.leader_of(6), Some(5));
        assert_eq!(run.quorum(), 2);
    }

    #[test]
    fn test_four_participants_confirm_by_round_three() {
        let recorder = Recorder::default();
        let mut network = network(config(4), &recorder);
        network.init().unwrap();
        assert_eq!(network.leader(), Some(0));

        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 4);

        for peer in network.peers() {
            assert_eq!(peer.ledger().len(), 1, "peer {}", peer.id());
            let entry = &peer.ledger()[0];
            assert_eq!(entry.transaction.id, 1);
            assert_eq!(entry.sequence, 0);
            assert_eq!(entry.result, 5);
            assert!(entry.round <= 3);
            assert_eq!(peer.sequence(), 1);
            assert_eq!(peer.phase(), Phase::PrePrepare);
            assert_eq!(peer.buffered_messages(), 0);
        }
        assert!(recorder.rounds_of(|e| matches!(e, Event::ViewChangeSent { .. })).is_empty());

        let metrics = network.metrics();
        assert_eq!(metrics.min_ledger, 1);
        assert_eq!(metrics.max_ledger, 1);
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.throughput.last(), Some(&1));
    }

    #[test]
    fn test_crashed_leader_triggers_view_change() {
        let recorder = Recorder::default();
        let config = SimConfig {
            timeout_rounds: 5,
            crash_count: 1,
            crash_rate: 1.0,
            ..config(4)
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();
        assert_eq!(network.peer(&0).unwrap().crash_round(), Some(0));

        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 12);

        let view_changes = recorder.rounds_of(|e| *e == Event::ViewChangeSent { target_view: 1 });
        assert_eq!(view_changes.len(), 3);
        assert!(view_changes.iter().all(|(round, _)| *round == 5));

        let new_views = recorder.rounds_of(|e| *e == Event::NewViewSent { view: 1 });
        assert_eq!(new_views, vec![(6, 1)]);

        for id in 1..4 {
            let peer = network.peer(&id).unwrap();
            assert_eq!(peer.view(), 1);
            assert!(!peer.is_paused());
            assert_eq!(peer.ledger().len(), 1);
            assert_eq!(peer.ledger()[0].view, 1);
            assert!(peer.ledger()[0].round <= 9);
        }
        assert!(network.peer(&1).unwrap().is_leader());

        let crashed = network.peer(&0).unwrap();
        assert!(crashed.core().is_crashed());
        assert!(crashed.ledger().is_empty());
        assert_eq!(network.metrics().min_ledger, 0);
    }

    #[test]
    fn test_self_submit_crashed_leader_changes_view() {
        let recorder = Recorder::default();
        let config = SimConfig {
            self_submit: true,
            timeout_rounds: 5,
            crash_count: 1,
            crash_rate: 1.0,
            ..config(4)
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();

        // nobody but the crashed leader would ever create a transaction
        run_rounds(&mut network, 12);

        let view_changes = recorder.rounds_of(|e| *e == Event::ViewChangeSent { target_view: 1 });
        assert_eq!(view_changes.len(), 3);
        assert!(view_changes.iter().all(|(round, _)| *round == 5));
        assert_eq!(
            recorder.rounds_of(|e| *e == Event::NewViewSent { view: 1 }),
            vec![(6, 1)]
        );

        for id in 1..4 {
            let peer = network.peer(&id).unwrap();
            assert_eq!(peer.view(), 1);
            assert!(!peer.ledger().is_empty());
            assert_eq!(peer.ledger()[0].view, 1);
            assert!(peer.ledger()[0].round <= 8);
        }
        assert!(network.peer(&0).unwrap().ledger().is_empty());
    }

    #[test]
    fn test_unanswered_view_change_escalates() {
        let recorder = Recorder::default();
        let config = SimConfig {
            timeout_rounds: 5,
            crash_count: 2,
            crash_rate: 1.0,
            ..config(4)
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();

        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 25);

        // the candidate for view 1 is down, so view 2 takes over
        let escalations = recorder.rounds_of(|e| *e == Event::ViewChangeSent { target_view: 2 });
        assert!(!escalations.is_empty());
        assert!(escalations.iter().all(|(round, _)| *round > 5));
        assert!(recorder
            .rounds_of(|e| *e == Event::NewViewSent { view: 1 })
            .is_empty());

        for id in 2..4 {
            let peer = network.peer(&id).unwrap();
            assert_eq!(peer.view(), 2);
            assert_eq!(peer.ledger().len(), 1);
        }
    }

    #[test]
    fn test_duplicate_delivery_changes_nothing() {
        let recorder = Recorder::default();
        let mut network = network(config(4), &recorder);
        network.init().unwrap();
        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 4);

        let round = network.round();
        let peer = network.peer_mut(&2).unwrap();
        let before = (
            peer.sequence(),
            peer.view(),
            peer.phase(),
            peer.ledger().to_vec(),
            peer.pending_transactions().len(),
            peer.buffered_messages(),
            peer.timer(),
        );

        let duplicates = vec![
            message(0, MessageKind::PrePrepare, 0, 0),
            message(1, MessageKind::Prepare, 0, 0),
            message(3, MessageKind::Commit, 0, 0),
            request(1, 0),
        ];
        for duplicate in duplicates {
            peer.core_mut()
                .push_inbound(Envelope::new(duplicate.sender, 2, duplicate));
        }
        let mut rng = StdRng::from_seed([0u8; 32]);
        peer.perform_computation(round, &mut rng).unwrap();

        let after = (
            peer.sequence(),
            peer.view(),
            peer.phase(),
            peer.ledger().to_vec(),
            peer.pending_transactions().len(),
            peer.buffered_messages(),
            peer.timer(),
        );
        assert_eq!(before, after);
        assert_eq!(peer.core().outbound_len(), 0);
    }

    #[test]
    fn test_votes_from_other_views_do_not_count() {
        let mut rng = StdRng::from_seed([0u8; 32]);
        let mut peers: Vec<PbftPeer> = (0..4).map(PbftPeer::new).collect();
        {
            let mut refs: Vec<&mut PbftPeer> = peers.iter_mut().collect();
            PbftPeer::init_parameters(&mut refs, &config(4), &mut rng).unwrap();
        }
        let follower = &mut peers[1];

        follower
            .core_mut()
            .push_inbound(Envelope::new(0, 1, message(0, MessageKind::PrePrepare, 0, 0)));
        follower.perform_computation(0, &mut rng).unwrap();
        // pre-prepare plus our own prepare reach the quorum of 2
        assert_eq!(follower.phase(), Phase::Commit);

        for sender in [2, 3] {
            follower
                .core_mut()
                .push_inbound(Envelope::new(sender, 1, message(sender, MessageKind::Commit, 5, 0)));
        }
        follower.perform_computation(1, &mut rng).unwrap();
        assert_eq!(follower.phase(), Phase::Commit);
        assert!(follower.ledger().is_empty());

        follower
            .core_mut()
            .push_inbound(Envelope::new(2, 1, message(2, MessageKind::Commit, 0, 0)));
        follower.perform_computation(2, &mut rng).unwrap();
        assert_eq!(follower.ledger().len(), 1);
        assert_eq!(follower.ledger()[0].round, 2);
        assert_eq!(follower.latency_total(), 2);
    }

    #[test]
    fn test_missing_primary_is_fatal() {
        let mut rng = StdRng::from_seed([0u8; 32]);
        let mut peer = PbftPeer::new(3);
        assert!(matches!(
            peer.perform_computation(0, &mut rng),
            Err(SimError::NoPrimary { peer: 3 })
        ));
    }

    #[test]
    fn test_byzantine_follower_does_not_block() {
        let recorder = Recorder::default();
        let mut network = network(config(4), &recorder);
        network.init().unwrap();
        network.set_byzantine(&[3], true).unwrap();

        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 4);

        for id in 0..3 {
            assert_eq!(network.peer(&id).unwrap().ledger().len(), 1);
        }
    }

    #[test]
    fn test_byzantine_leader_is_replaced() {
        let recorder = Recorder::default();
        let config = SimConfig {
            timeout_rounds: 5,
            ..config(4)
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();
        network.set_byzantine(&[0], true).unwrap();

        network.inject_all(request(1, 0)).unwrap();
        run_rounds(&mut network, 5);
        assert!(network.peers().all(|p| p.ledger().is_empty()));

        run_rounds(&mut network, 7);
        for id in 1..4 {
            let peer = network.peer(&id).unwrap();
            assert_eq!(peer.view(), 1);
            assert_eq!(peer.ledger().len(), 1);
        }
        assert_eq!(network.peer(&0).unwrap().view(), 1);
        assert_eq!(network.leader(), Some(1));
    }

    #[test]
    fn test_self_submitting_leader_keeps_committing() {
        let recorder = Recorder::default();
        let config = SimConfig {
            self_submit: true,
            ..config(4)
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();
        run_rounds(&mut network, 20);

        let leader = network.peer(&0).unwrap();
        assert!(leader.ledger().len() >= 5);
        for peer in network.peers() {
            for (a, b) in peer.ledger().iter().zip(leader.ledger()) {
                assert_eq!(a.sequence, b.sequence);
                assert_eq!(a.transaction.id, b.transaction.id);
            }
        }
    }

    #[test]
    fn test_single_participant_commits_alone() {
        let recorder = Recorder::default();
        let mut network = network(config(1), &recorder);
        network.init().unwrap();
        network.inject_all(request(4, 0)).unwrap();
        network.run_round().unwrap();

        let peer = network.peer(&0).unwrap();
        assert_eq!(peer.ledger().len(), 1);
        assert_eq!(peer.ledger()[0].round, 0);
    }

    #[test]
    fn test_views_and_ledgers_never_shrink() {
        let recorder = Recorder::default();
        let config = SimConfig {
            participant_count: 7,
            fault_fraction: 0.3,
            timeout_rounds: 6,
            crash_count: 1,
            crash_rate: 0.05,
            delay: DelayModel::Uniform { min: 1, max: 3 },
            seed: Some([5u8; 32]),
            ..SimConfig::default()
        };
        let mut network = network(config, &recorder);
        network.init().unwrap();
        network.set_byzantine(&[4], true).unwrap();

        let mut views: Vec<View> = vec![0; 7];
        let mut ledgers: Vec<usize> = vec![0; 7];
        for round in 0..150u64 {
            if round % 4 == 0 {
                network.inject_all(request(round + 1, round)).unwrap();
            }
            network.run_round().unwrap();
            for (i, peer) in network.peers().enumerate() {
                assert!(peer.view() >= views[i]);
                assert!(peer.ledger().len() >= ledgers[i]);
                views[i] = peer.view();
                ledgers[i] = peer.ledger().len();
            }
        }
    }

    #[test]
    fn test_rotate_leader_moves_to_next_member() {
        let recorder = Recorder::default();
        let mut network = network(config(4), &recorder);
        network.init().unwrap();
        network.rotate_leader();

        assert_eq!(network.leader(), Some(1));
        assert!(network.peers().all(|p| p.view() == 1));
    }
}
