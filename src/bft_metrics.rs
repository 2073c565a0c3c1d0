//! Per-run aggregate metrics and the sinks that consume them.
//!
//! The core never performs file I/O: a caller hands in a `MetricsSink` (or a
//! writer wrapped in `CsvSink`) and decides where the numbers end up.

use std::io::Write;

use serde::Serialize;

use crate::bft_error::SimError;
use crate::bft_interface::Round;

/// Aggregated results of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    /// Rounds executed
    pub rounds: Round,

    /// Shortest confirmed ledger across participants (stalled participants pull this down)
    pub min_ledger: usize,

    /// Longest confirmed ledger across participants
    pub max_ledger: usize,

    /// Envelopes sent by all participants
    pub total_messages: usize,

    /// Client requests injected by the driver
    pub total_requests: usize,

    /// One throughput sample per round
    pub throughput: Vec<usize>,

    /// Sum of confirmation latencies over all participants
    pub total_latency: Round,

    /// Confirmations counted in `total_latency`
    pub total_confirmed: usize,
}

impl RunMetrics {
    pub fn avg_latency(&self) -> f64 {
        if self.total_confirmed == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.total_confirmed as f64
        }
    }

    pub fn messages_per_request(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_messages as f64 / self.total_requests as f64
        }
    }

    /// Combine the metrics of independent groups: ledger bounds, counts and
    /// throughput samples add up.
    pub fn merge(&mut self, other: &RunMetrics) {
        self.rounds = self.rounds.max(other.rounds);
        self.min_ledger += other.min_ledger;
        self.max_ledger += other.max_ledger;
        self.total_messages += other.total_messages;
        self.total_requests += other.total_requests;
        self.total_latency += other.total_latency;
        self.total_confirmed += other.total_confirmed;

        if self.throughput.len() < other.throughput.len() {
            self.throughput.resize(other.throughput.len(), 0);
        }
        for (sample, add) in self.throughput.iter_mut().zip(&other.throughput) {
            *sample += add;
        }
    }

    /// Print a summary of the run
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║        BFT Simulation Results                          ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Rounds: {}", self.rounds);
        println!("Ledger: min={}, max={}", self.min_ledger, self.max_ledger);
        println!("Requests: {}", self.total_requests);
        println!("Messages: {}", self.total_messages);
        println!("  per request: {:.1}", self.messages_per_request());
        println!("Average latency: {:.2} rounds", self.avg_latency());
        if let Some(last) = self.throughput.last() {
            println!("Final throughput sample: {}", last);
        }
        println!();
    }
}

/// Consumer of per-run metrics
pub trait MetricsSink {
    fn record(&mut self, metrics: &RunMetrics) -> Result<(), SimError>;
}

/// Discards everything
pub struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn record(&mut self, _metrics: &RunMetrics) -> Result<(), SimError> {
        Ok(())
    }
}

/// Keeps every recorded run in memory
#[derive(Debug, Default)]
pub struct CollectorSink {
    pub runs: Vec<RunMetrics>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsSink for CollectorSink {
    fn record(&mut self, metrics: &RunMetrics) -> Result<(), SimError> {
        self.runs.push(metrics.clone());
        Ok(())
    }
}

/// Writes `Key:,value` lines to any writer, one block per run
pub struct CsvSink<W: Write> {
    writer: W,
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> MetricsSink for CsvSink<W> {
    fn record(&mut self, metrics: &RunMetrics) -> Result<(), SimError> {
        writeln!(self.writer, "Min Ledger:,{}", metrics.min_ledger)?;
        writeln!(self.writer, "Max Ledger:,{}", metrics.max_ledger)?;
        writeln!(self.writer, "Total Messages:,{}", metrics.total_messages)?;
        writeln!(self.writer, "Total Request:,{}", metrics.total_requests)?;
        writeln!(self.writer, "Avg Latency:,{:.2}", metrics.avg_latency())?;
        let samples: Vec<String> = metrics.throughput.iter().map(|s| s.to_string()).collect();
        writeln!(self.writer, "Throughput:,{}", samples.join(","))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(min: usize, max: usize, throughput: Vec<usize>) -> RunMetrics {
        RunMetrics {
            rounds: throughput.len() as Round,
            min_ledger: min,
            max_ledger: max,
            total_messages: 40,
            total_requests: 4,
            throughput,
            total_latency: 12,
            total_confirmed: 4,
        }
    }

    #[test]
    fn test_merge_adds_groups() {
        let mut total = sample(1, 2, vec![0, 1, 2]);
        total.merge(&sample(3, 3, vec![1, 1, 1, 3]));

        assert_eq!(total.min_ledger, 4);
        assert_eq!(total.max_ledger, 5);
        assert_eq!(total.total_messages, 80);
        assert_eq!(total.throughput, vec![1, 2, 3, 3]);
        assert_eq!(total.rounds, 4);
        assert_eq!(total.avg_latency(), 3.0);
    }

    #[test]
    fn test_averages_without_data() {
        let empty = RunMetrics::default();
        assert_eq!(empty.avg_latency(), 0.0);
        assert_eq!(empty.messages_per_request(), 0.0);
    }

    #[test]
    fn test_csv_sink_output() {
        let mut sink = CsvSink::new(Vec::new());
        sink.record(&sample(1, 2, vec![0, 2])).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Min Ledger:,1");
        assert_eq!(lines[1], "Max Ledger:,2");
        assert_eq!(lines[2], "Total Messages:,40");
        assert_eq!(lines[3], "Total Request:,4");
        assert_eq!(lines[4], "Avg Latency:,3.00");
        assert_eq!(lines[5], "Throughput:,0,2");
    }

    #[test]
    fn test_collector_keeps_runs() {
        let mut sink = CollectorSink::new();
        sink.record(&sample(0, 1, vec![])).unwrap();
        sink.record(&sample(2, 2, vec![])).unwrap();
        assert_eq!(sink.runs.len(), 2);
        assert_eq!(sink.runs[1].min_ledger, 2);
    }
}
