//! # bft-sim - Round-Based BFT Consensus Simulator
//!
//! A discrete-event simulator for Byzantine-fault-tolerant consensus. A run is
//! a set of logical participants exchanging envelopes over a simulated network
//! with configurable delay, advancing in lockstep rounds.
//!
//! ## Core Components
//!
//! - **Network**: participant registry, delay-model transport and the
//!   deliver -> step -> flush round barrier
//! - **Participant**: the protocol contract (`PeerCore` holds the queues and
//!   fault flags every protocol shares)
//! - **PbftPeer**: three-phase commit with timeout-driven view change
//! - **Committees**: fixed-size groups, each an independent network
//! - **SimRunner**: request injection, Byzantine reshuffles and metrics
//!
//! ## Usage
//!
//! ```no_run
//! use bft_sim::{NoOpMetrics, SimConfig, SimRunner};
//!
//! let config = SimConfig {
//!     participant_count: 7,
//!     fault_fraction: 0.3,
//!     max_rounds: 200,
//!     ..SimConfig::default()
//! };
//!
//! let result = SimRunner::new(config)?.run(&mut NoOpMetrics)?;
//! result.metrics.print_summary();
//! # Ok::<(), bft_sim::SimError>(())
//! ```
//!
//! Scenario files and the runner binary live in `simulator/` and `scenarios/`.

// Harness
pub mod bft_config;
pub mod bft_delay;
pub mod bft_error;
pub mod bft_interface;
pub mod bft_metrics;
pub mod bft_network;

// Protocols
pub mod bft_echo;
pub mod bft_pbft;

// Grouping and driver
pub mod bft_committee;
pub mod bft_runner;

// Re-export commonly used types
pub use bft_committee::Committees;
pub use bft_config::{ByzantineConfig, RequestConfig, SimConfig};
pub use bft_delay::DelayModel;
pub use bft_error::SimError;
pub use bft_interface::{
    Envelope, Event, EventSink, LoggingEventSink, NoOpSink, Participant, PeerCore, PeerId, Round,
    Sequence, View, CLIENT_ID,
};
pub use bft_metrics::{CollectorSink, CsvSink, MetricsSink, NoOpMetrics, RunMetrics};
pub use bft_network::{quorum_size, Network};
pub use bft_pbft::{
    ConfirmedTransaction, MessageKind, OpCode, Operation, PbftMessage, PbftPeer, Phase,
    Transaction,
};
pub use bft_runner::{SimResult, SimRunner};
