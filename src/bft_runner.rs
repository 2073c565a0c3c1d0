//! Driver loop for PBFT runs.
//!
//! Builds the committees from a `SimConfig`, feeds client requests, moves the
//! Byzantine population around and collects the final metrics.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::bft_committee::Committees;
use crate::bft_config::SimConfig;
use crate::bft_error::SimError;
use crate::bft_interface::{EventSink, NoOpSink, PeerId, Round, TransactionId};
use crate::bft_metrics::{MetricsSink, RunMetrics};
use crate::bft_pbft::{Operation, PbftMessage, PbftPeer, Transaction};

/// Outcome of one run
#[derive(Debug, Clone, PartialEq)]
pub struct SimResult {
    pub metrics: RunMetrics,
    pub seed: [u8; 32],
    pub groups: usize,
}

pub struct SimRunner {
    config: SimConfig,
    committees: Committees<PbftPeer>,
    rng: StdRng,
    seed: [u8; 32],
}

impl SimRunner {
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        Self::with_event_sink(config, |_| Box::new(NoOpSink))
    }

    /// Build a runner whose participants report to sinks made by `make_sink`
    pub fn with_event_sink<F>(config: SimConfig, mut make_sink: F) -> Result<Self, SimError>
    where
        F: FnMut(PeerId) -> Box<dyn EventSink>,
    {
        config.validate()?;
        if config.byzantine.initial > config.participant_count {
            return Err(SimError::InvalidConfig(format!(
                "{} initial byzantine participants out of {}",
                config.byzantine.initial, config.participant_count
            )));
        }

        let seed = config.resolve_seed();
        let peers: Vec<PbftPeer> = (0..config.participant_count as PeerId)
            .map(|id| PbftPeer::new_with_sink(id, make_sink(id)))
            .collect();
        let group_size = config.committee_size.unwrap_or(config.participant_count);

        let mut committees = Committees::with_seed(config.clone(), peers, group_size, seed)?;
        committees.init()?;

        let mut runner = Self {
            config,
            committees,
            rng: StdRng::from_seed(seed),
            seed,
        };
        runner.flag_initial_byzantine()?;
        Ok(runner)
    }

    /// Initial Byzantine population, drawn from non-leaders first
    fn flag_initial_byzantine(&mut self) -> Result<(), SimError> {
        let count = self.config.byzantine.initial;
        if count == 0 {
            return Ok(());
        }

        let leaders: Vec<PeerId> = (0..self.committees.number_of_groups())
            .filter_map(|g| self.committees.leader_of(g))
            .collect();
        let mut candidates: Vec<PeerId> = (0..self.config.participant_count as PeerId).collect();
        candidates.shuffle(&mut self.rng);
        candidates.sort_by_key(|id| leaders.contains(id));

        for id in candidates.into_iter().take(count) {
            self.committees.set_byzantine(id, true)?;
        }
        info!(
            "flagged {} initial byzantine participants",
            self.committees.byzantine_count()
        );
        Ok(())
    }

    fn inject_requests(&mut self, round: Round) -> Result<(), SimError> {
        let requests = &self.config.requests;
        if requests.interval == 0 || round < requests.start_round {
            return Ok(());
        }
        if (round - requests.start_round) % requests.interval != 0 {
            return Ok(());
        }

        let group = self.rng.gen_range(0..self.committees.number_of_groups());
        let a = self.rng.gen_range(0..100);
        let b = self.rng.gen_range(0..100);
        let operation = if self.rng.gen_bool(0.5) {
            Operation::add(a, b)
        } else {
            Operation::subtract(a, b)
        };
        let id = self.allocate_transaction_id(group)?;
        let transaction = Transaction::new(id, operation, round);

        debug!(
            "round {}: request {} for committee {}",
            round, transaction.id, group
        );
        self.committees
            .inject(group, PbftMessage::request(transaction))
    }

    /// Request ids come from the committee's own counter, the one a
    /// self-submitting leader generates from
    fn allocate_transaction_id(&self, group: usize) -> Result<TransactionId, SimError> {
        self.committees
            .group(group)
            .and_then(|g| g.peer_at(0))
            .and_then(|peer| peer.run())
            .map(|run| run.borrow_mut().next_transaction_id())
            .ok_or(SimError::UnknownGroup(group))
    }

    fn reshuffle(&mut self, round: Round) {
        let byzantine = &self.config.byzantine;
        if byzantine.shuffle_interval == 0 || round == 0 || round % byzantine.shuffle_interval != 0 {
            return;
        }
        let count = byzantine.shuffle_count;
        self.committees.shuffle_byzantine(count);
    }

    /// Requests, reshuffle, then one transport round
    pub fn run_round(&mut self) -> Result<(), SimError> {
        let round = self.committees.round();
        self.inject_requests(round)?;
        self.reshuffle(round);
        self.committees.run_round()
    }

    /// Run `max_rounds` rounds and hand the metrics to `sink`
    pub fn run(mut self, sink: &mut dyn MetricsSink) -> Result<SimResult, SimError> {
        info!(
            "starting PBFT run: {} participants in {} committee(s), {} rounds, seed {:02x?}",
            self.config.participant_count,
            self.committees.number_of_groups(),
            self.config.max_rounds,
            &self.seed[..4]
        );

        while self.committees.round() < self.config.max_rounds {
            self.run_round()?;
        }
        self.finish(sink)
    }

    pub fn finish(self, sink: &mut dyn MetricsSink) -> Result<SimResult, SimError> {
        let metrics = self.committees.metrics();
        sink.record(&metrics)?;
        info!(
            "run finished after {} rounds: ledger min={} max={}, {} messages, {} requests",
            metrics.rounds,
            metrics.min_ledger,
            metrics.max_ledger,
            metrics.total_messages,
            metrics.total_requests
        );
        Ok(SimResult {
            metrics,
            seed: self.seed,
            groups: self.committees.number_of_groups(),
        })
    }

    pub fn committees(&self) -> &Committees<PbftPeer> {
        &self.committees
    }

    pub fn committees_mut(&mut self) -> &mut Committees<PbftPeer> {
        &mut self.committees
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }
}
