//! Run configuration.
//!
//! Handed once to `Participant::init_parameters` and to the transport. Loaded
//! from YAML scenario files or built from `Default` and adjusted in code.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bft_delay::DelayModel;
use crate::bft_error::SimError;
use crate::bft_interface::Round;

/// Configuration for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of participants in the run
    pub participant_count: usize,

    /// Tolerated fault fraction, feeds `quorum_size`
    pub fault_fraction: f64,

    /// Upper bound on the Byzantine population kept by reshuffles
    /// (None = same as `fault_fraction`)
    pub byzantine_fraction: Option<f64>,

    /// Rounds without progress before a follower asks for a view change
    pub timeout_rounds: Round,

    /// Number of crash candidates (the first leaders in view order)
    pub crash_count: usize,

    /// Per-round crash probability of a candidate (>= 1.0 crashes at round 0)
    pub crash_rate: f64,

    /// Network delay model
    pub delay: DelayModel,

    /// Number of rounds to simulate
    pub max_rounds: Round,

    /// Random seed (None = generate random)
    pub seed: Option<[u8; 32]>,

    /// The leader generates its own transactions instead of waiting for clients
    pub self_submit: bool,

    /// Partition participants into committees of this size
    pub committee_size: Option<usize>,

    /// Client request injection
    pub requests: RequestConfig,

    /// Byzantine population management
    pub byzantine: ByzantineConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            participant_count: 4,
            fault_fraction: 0.25,
            byzantine_fraction: None,
            timeout_rounds: 20,
            crash_count: 0,
            crash_rate: 0.0,
            delay: DelayModel::default(),
            max_rounds: 100,
            seed: None,
            self_submit: false,
            committee_size: None,
            requests: RequestConfig::default(),
            byzantine: ByzantineConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SimError> {
        let config: SimConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run. Called before round 0.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.participant_count == 0 {
            return Err(SimError::EmptyNetwork);
        }
        if !(0.0..=1.0).contains(&self.fault_fraction) {
            return Err(SimError::InvalidFaultFraction(self.fault_fraction));
        }
        if let Some(fraction) = self.byzantine_fraction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(SimError::InvalidFaultFraction(fraction));
            }
        }
        if self.crash_rate.is_nan() || self.crash_rate < 0.0 {
            return Err(SimError::InvalidConfig(format!(
                "crash rate {} must not be negative",
                self.crash_rate
            )));
        }
        if self.timeout_rounds == 0 {
            return Err(SimError::InvalidConfig(
                "timeout_rounds must be at least 1".to_string(),
            ));
        }
        if let Some(size) = self.committee_size {
            if size == 0 || size > self.participant_count {
                return Err(SimError::InvalidGroupSize {
                    group_size: size,
                    participants: self.participant_count,
                });
            }
        }
        self.delay.validate()
    }

    /// Get or generate seed
    pub fn resolve_seed(&self) -> [u8; 32] {
        self.seed.unwrap_or_else(|| {
            let mut temp_rng = StdRng::from_entropy();
            let mut seed = [0u8; 32];
            temp_rng.fill_bytes(&mut seed);
            seed
        })
    }

    pub fn byzantine_bound(&self, participants: usize) -> usize {
        let fraction = self.byzantine_fraction.unwrap_or(self.fault_fraction);
        (participants as f64 * fraction).floor() as usize
    }
}

/// How the driver feeds client requests into the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Rounds between two requests (0 = no requests)
    pub interval: Round,

    /// First round a request is injected
    pub start_round: Round,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            interval: 5,
            start_round: 0,
        }
    }
}

/// Byzantine population at start and how it moves during the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByzantineConfig {
    /// Participants flagged Byzantine before round 0
    pub initial: usize,

    /// Rounds between reshuffles (0 = never)
    pub shuffle_interval: Round,

    /// Participants flipped per reshuffle
    pub shuffle_count: usize,
}
