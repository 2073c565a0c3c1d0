//! PBFT Simulation Example
//!
//! Run with: cargo run --example pbft_sim

use bft_sim::{
    ByzantineConfig, CollectorSink, DelayModel, LoggingEventSink, RequestConfig, SimConfig,
    SimRunner,
};
use log::info;
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        PBFT Simulator                                  ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    info!("Setting up PBFT simulation...");

    let config = SimConfig {
        participant_count: 10,
        fault_fraction: 0.3,
        timeout_rounds: 15,
        crash_count: 1,
        crash_rate: 0.02,
        delay: DelayModel::Poisson { lambda: 1.5 },
        max_rounds: 300,
        seed: None, // Will be auto-generated

        requests: RequestConfig {
            interval: 4,
            start_round: 0,
        },

        byzantine: ByzantineConfig {
            initial: 2,
            shuffle_interval: 50,
            shuffle_count: 1,
        },

        ..SimConfig::default()
    };

    info!("Configuration:");
    info!("  Participants: {}", config.participant_count);
    info!("  Rounds: {}", config.max_rounds);
    info!("  Delay: {:?}", config.delay);
    info!("  Byzantine at start: {}", config.byzantine.initial);
    info!("");

    info!("Starting simulation...");

    // view changes and crashes show up at info level
    let runner = SimRunner::with_event_sink(config, |_| Box::new(LoggingEventSink))
        .unwrap_or_else(|e| {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        });

    let mut sink = CollectorSink::new();
    let result = runner.run(&mut sink).unwrap_or_else(|e| {
        eprintln!("Run failed: {}", e);
        std::process::exit(1);
    });

    // Display results
    result.metrics.print_summary();
    println!("Seed: {:02x?}", result.seed);
}
