//! Minimal participant: greets every neighbor each round and keeps what it
//! heard. Carries no protocol state, so it is handy for exercising the
//! transport on its own.

use log::debug;
use rand::rngs::StdRng;

use crate::bft_config::SimConfig;
use crate::bft_error::SimError;
use crate::bft_interface::{Participant, PeerCore, PeerId, Round};

#[derive(Clone, Debug, PartialEq)]
pub struct EchoMessage {
    pub text: String,
    pub sender: PeerId,
    /// Round the message was produced in
    pub round: Round,
}

pub struct EchoPeer {
    core: PeerCore<EchoMessage>,
    counter: u64,
    received: Vec<(Round, EchoMessage)>,
    steps: u64,
    leader: bool,
}

impl EchoPeer {
    pub fn new(id: PeerId) -> Self {
        Self {
            core: PeerCore::new(id),
            counter: 0,
            received: Vec::new(),
            steps: 0,
            leader: false,
        }
    }

    pub fn greeting(&self, round: Round) -> EchoMessage {
        EchoMessage {
            text: format!("Message: {} Hello From ", self.counter),
            sender: self.core.id(),
            round,
        }
    }

    /// Everything received so far, tagged with the round it was consumed in
    pub fn received(&self) -> &[(Round, EchoMessage)] {
        &self.received
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Participant for EchoPeer {
    type Message = EchoMessage;

    fn core(&self) -> &PeerCore<EchoMessage> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PeerCore<EchoMessage> {
        &mut self.core
    }

    /// The lowest id acts as leader; only used to give reshuffles a leader to avoid.
    fn init_parameters(
        peers: &mut [&mut Self],
        _config: &SimConfig,
        _rng: &mut StdRng,
    ) -> Result<(), SimError> {
        let lowest = peers.iter().map(|p| p.id()).min();
        for peer in peers.iter_mut() {
            peer.leader = Some(peer.id()) == lowest;
        }
        Ok(())
    }

    fn perform_computation(&mut self, round: Round, _rng: &mut StdRng) -> Result<(), SimError> {
        self.steps += 1;
        if self.core.is_crashed() {
            self.core.drain_inbound();
            return Ok(());
        }

        let greeting = self.greeting(round);
        self.core.broadcast(greeting);

        for envelope in self.core.drain_inbound() {
            debug!(
                "{} p:{} received from {}: {}{}",
                round, self.core.id(), envelope.source, envelope.payload.text, envelope.payload.sender
            );
            self.received.push((round, envelope.payload));
        }
        self.counter += 1;
        Ok(())
    }

    fn end_of_round(peers: &[&Self], _round: Round) -> Option<usize> {
        Some(peers.iter().map(|p| p.received.len()).sum())
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn ledger_len(&self) -> usize {
        self.received.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_greets_every_neighbor() {
        let mut rng = StdRng::from_seed([0u8; 32]);
        let mut peer = EchoPeer::new(1);
        peer.core_mut().set_neighbors([0, 2, 3]);

        peer.perform_computation(0, &mut rng).unwrap();
        peer.perform_computation(1, &mut rng).unwrap();

        assert_eq!(peer.core().outbound_len(), 6);
        assert_eq!(peer.steps(), 2);
        assert_eq!(peer.greeting(2).text, "Message: 2 Hello From ");
    }

    #[test]
    fn test_lowest_id_leads() {
        let mut rng = StdRng::from_seed([0u8; 32]);
        let mut a = EchoPeer::new(5);
        let mut b = EchoPeer::new(2);
        {
            let mut peers = vec![&mut a, &mut b];
            EchoPeer::init_parameters(&mut peers, &SimConfig::default(), &mut rng).unwrap();
        }
        assert!(!a.is_leader());
        assert!(b.is_leader());
    }
}
