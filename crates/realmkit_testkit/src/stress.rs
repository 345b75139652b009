//! Stress helpers for many threads sharing one realm path.

use realmkit_core::{get_shared_realm, OpenConfig, Value};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of threads.
    pub threads: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
        }
    }
}

/// Every thread opens its own handle on `config` and commits `operations`
/// single-row inserts into `table`.
///
/// `config` must carry a schema with `table` and an `Int` column `value`.
/// Afterwards the table holds exactly `successful_ops` rows.
pub fn stress_concurrent_writers(
    config: &OpenConfig,
    table: &str,
    stress: &StressConfig,
) -> StressTestResult {
    let barrier = Arc::new(Barrier::new(stress.threads));
    let start = Instant::now();

    let handles: Vec<_> = (0..stress.threads)
        .map(|t| {
            let config = config.clone();
            let table = table.to_string();
            let barrier = Arc::clone(&barrier);
            let operations = stress.operations;
            thread::spawn(move || {
                let realm = get_shared_realm(config).expect("Failed to open realm");
                barrier.wait();
                let mut successful = 0usize;
                let mut failed = 0usize;
                for i in 0..operations {
                    let value = (t * operations + i) as i64;
                    match realm.transaction(|group| {
                        group
                            .table_mut(&table)?
                            .insert(&[("value", Value::Int(value))])
                    }) {
                        Ok(_) => successful += 1,
                        Err(_) => failed += 1,
                    }
                }
                (successful, failed)
            })
        })
        .collect();

    let (successful, failed) = handles
        .into_iter()
        .map(|h| h.join().expect("stress thread panicked"))
        .fold((0, 0), |(s, f), (ds, df)| (s + ds, f + df));

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Every thread opens `config` at once and reports which coordinator it got.
///
/// Returns the number of distinct coordinators seen, which must be one.
pub fn stress_concurrent_opens(config: &OpenConfig, threads: usize) -> usize {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let config = config.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let realm = get_shared_realm(config).expect("Failed to open realm");
                let coordinator = Arc::clone(realm.coordinator());
                // Keep the handle alive until every thread has opened.
                barrier.wait();
                drop(realm);
                coordinator
            })
        })
        .collect();

    let coordinators: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("open thread panicked"))
        .collect();
    let mut distinct: Vec<_> = Vec::new();
    for coordinator in &coordinators {
        if !distinct.iter().any(|c| Arc::ptr_eq(c, coordinator)) {
            distinct.push(Arc::clone(coordinator));
        }
    }
    distinct.len()
}
