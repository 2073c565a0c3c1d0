//! Errors reported by the simulation harness.
//!
//! Only configuration problems surface as errors. Stale or out-of-view protocol
//! messages are dropped by the engines themselves and never reach this type.

use thiserror::Error;

use crate::bft_interface::PeerId;

#[derive(Debug, Error)]
pub enum SimError {
    /// The registry has no participants
    #[error("network has no participants")]
    EmptyNetwork,

    #[error("participant {0} is already registered")]
    DuplicatePeer(PeerId),

    #[error("participant {0} is not registered")]
    UnknownPeer(PeerId),

    /// A round was started before `init()`
    #[error("network was not initialized before the first round")]
    NotInitialized,

    #[error("network is already initialized")]
    AlreadyInitialized,

    /// A consensus participant has no leader for its current view
    #[error("participant {peer} has no primary configured")]
    NoPrimary { peer: PeerId },

    #[error("fault fraction {0} is outside [0, 1]")]
    InvalidFaultFraction(f64),

    #[error("invalid delay model: {0}")]
    InvalidDelay(String),

    #[error("group size {group_size} cannot partition {participants} participants")]
    InvalidGroupSize {
        group_size: usize,
        participants: usize,
    },

    #[error("committee {0} does not exist")]
    UnknownGroup(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse scenario: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to write metrics: {0}")]
    Io(#[from] std::io::Error),
}
