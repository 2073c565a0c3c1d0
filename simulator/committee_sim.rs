//! Committee Simulation Example
//!
//! Splits the participants into independent PBFT committees and drives them
//! round by round, rotating one committee's leader halfway through.
//!
//! Run with: cargo run --example committee_sim

use bft_sim::{NoOpMetrics, Participant, SimConfig, SimRunner};
use log::info;
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        Committee Simulator                             ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let config = SimConfig {
        participant_count: 16,
        committee_size: Some(5),
        max_rounds: 200,
        seed: Some([7u8; 32]),
        ..SimConfig::default()
    };

    let mut runner = SimRunner::new(config).unwrap_or_else(|e| {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    });

    let committees = runner.committees();
    info!("{} committees:", committees.number_of_groups());
    for (index, group) in committees.groups().enumerate() {
        info!(
            "  committee {}: members {:?}, leader {:?}",
            index,
            group.ids(),
            group.leader()
        );
    }

    let max_rounds = runner.config().max_rounds;
    while runner.committees().round() < max_rounds {
        if runner.committees().round() == max_rounds / 2 {
            runner.committees_mut().rotate_leader(0).unwrap_or_else(|e| {
                eprintln!("Rotation failed: {}", e);
                std::process::exit(1);
            });
            info!("committee 0 leader is now {:?}", runner.committees().leader_of(0));
        }
        runner.run_round().unwrap_or_else(|e| {
            eprintln!("Run failed: {}", e);
            std::process::exit(1);
        });
    }

    println!("\n{:<12} {:>8} {:>8} {:>10}", "Committee", "Min", "Max", "Messages");
    println!("{}", "-".repeat(42));
    for (index, group) in runner.committees().groups().enumerate() {
        let metrics = group.metrics();
        let leader_ledger = group
            .peers()
            .find(|p| p.is_leader())
            .map_or(0, |p| p.ledger_len());
        println!(
            "{:<12} {:>8} {:>8} {:>10}   (leader ledger {})",
            index, metrics.min_ledger, metrics.max_ledger, metrics.total_messages, leader_ledger
        );
    }

    let result = runner.finish(&mut NoOpMetrics).unwrap_or_else(|e| {
        eprintln!("Run failed: {}", e);
        std::process::exit(1);
    });
    result.metrics.print_summary();
}
