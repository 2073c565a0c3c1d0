//! Network delay models.
//!
//! A delay model maps a send at round `r` to a delivery at `r + Δ`. The model is
//! chosen once per run; every envelope draws its own Δ from the transport's
//! seeded rng, so a fixed seed reproduces the same schedule.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::bft_error::SimError;
use crate::bft_interface::Round;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayModel {
    /// Every envelope takes exactly `rounds`
    Fixed { rounds: Round },

    /// Δ drawn uniformly from `min..=max`
    Uniform { min: Round, max: Round },

    /// Δ drawn from a Poisson distribution with mean `lambda`
    Poisson { lambda: f64 },
}

impl Default for DelayModel {
    fn default() -> Self {
        DelayModel::Fixed { rounds: 1 }
    }
}

impl DelayModel {
    pub fn validate(&self) -> Result<(), SimError> {
        match self {
            DelayModel::Fixed { .. } => Ok(()),
            DelayModel::Uniform { min, max } if min > max => Err(SimError::InvalidDelay(format!(
                "uniform min {} is greater than max {}",
                min, max
            ))),
            DelayModel::Uniform { .. } => Ok(()),
            DelayModel::Poisson { lambda } if !lambda.is_finite() || *lambda <= 0.0 => Err(
                SimError::InvalidDelay(format!("poisson lambda {} must be positive", lambda)),
            ),
            DelayModel::Poisson { .. } => Ok(()),
        }
    }

    /// Draw the number of rounds an envelope spends in transit.
    ///
    /// A result of 0 is legal: the current round's deliveries are already
    /// done, so the envelope goes out with the next `deliver()`.
    pub fn sample(&self, rng: &mut StdRng) -> Round {
        match self {
            DelayModel::Fixed { rounds } => *rounds,
            // reversed bounds are rejected by validate(); never panic on them
            DelayModel::Uniform { min, max } => rng.gen_range(*min.min(max)..=*min.max(max)),
            DelayModel::Poisson { lambda } => match Poisson::new(*lambda) {
                Ok(poisson) => {
                    let drawn: f64 = poisson.sample(rng);
                    drawn.max(0.0) as Round
                }
                // rejected by validate(); fall back to the mean
                Err(_) => lambda.max(0.0).round() as Round,
            },
        }
    }

    /// Mean delay in rounds
    pub fn mean(&self) -> f64 {
        match self {
            DelayModel::Fixed { rounds } => *rounds as f64,
            DelayModel::Uniform { min, max } => (*min as f64 + *max as f64) / 2.0,
            DelayModel::Poisson { lambda } => *lambda,
        }
    }
}
