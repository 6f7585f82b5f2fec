//! Fan-in word counting across stages
//!
//! Several producer threads push lines into a "split" stage; its workers
//! break lines into words and forward them to a single-threaded "count"
//! stage that keeps the tallies without any locking of its own.
//!
//! Usage: cargo run --example fan_in --release

use parking_lot::Mutex;
use stage_runtime::{
    EventHandler, Result as StageResult, Runtime, RuntimeConfig, Sink, StageBuilder, StageContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TEXT: &[&str] = &[
    "the quick brown fox jumps over the lazy dog",
    "a stage owns a queue a handler and a thread pool",
    "the dog sleeps while the fox runs",
];

/// Splits lines and forwards words downstream
struct Splitter {
    next: Sink<String>,
}

impl EventHandler<String> for Splitter {
    fn handle_events(&self, lines: Vec<String>) -> StageResult<()> {
        let words: Vec<String> = lines
            .iter()
            .flat_map(|line| line.split_whitespace())
            .map(str::to_lowercase)
            .collect();
        self.next.enqueue_many(words)?;
        Ok(())
    }
}

/// Single-threaded tally of words
struct Counter {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl EventHandler<String> for Counter {
    fn init(&self, ctx: &StageContext<String>) -> StageResult<()> {
        info!(stage = ctx.name(), "Counter ready");
        Ok(())
    }

    fn handle_events(&self, words: Vec<String>) -> StageResult<()> {
        let mut counts = self.counts.lock();
        for word in words {
            *counts.entry(word).or_insert(0) += 1;
        }
        Ok(())
    }

    fn destroy(&self) -> StageResult<()> {
        info!(distinct = self.counts.lock().len(), "Counter destroyed");
        Ok(())
    }
}

fn main() -> StageResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_pairs([
        ("global.threadPool.blockTime", "20"),
        ("global.threadPool.terminationTimeout", "1000"),
        ("stages.split.threadPool.initialThreads", "2"),
        ("stages.split.threadPool.maxThreads", "4"),
        ("stages.split.threadPool.growBacklog", "100"),
    ])?;
    let runtime = Runtime::new(config);

    let counts = Arc::new(Mutex::new(HashMap::new()));
    let count = runtime.create_stage(
        StageBuilder::new(
            "count",
            Counter {
                counts: Arc::clone(&counts),
            },
        )
        .single_threaded(),
    )?;
    let split = runtime.create_stage(StageBuilder::new(
        "split",
        Splitter {
            next: count.sink().clone(),
        },
    ))?;

    let producers: Vec<_> = (0..3)
        .map(|producer| {
            let sink = split.sink().clone();
            thread::spawn(move || {
                for round in 0..1000 {
                    let line = TEXT[(producer + round) % TEXT.len()].to_string();
                    if sink.enqueue(line).is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        let _ = producer.join();
    }

    while !split.queue().is_empty() || !count.queue().is_empty() {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));

    let mut top: Vec<(String, usize)> = counts
        .lock()
        .iter()
        .map(|(word, n)| (word.clone(), *n))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (word, n) in top.iter().take(5) {
        println!("{word:>10} {n}");
    }
    if let Some(pool) = runtime.pool("split") {
        println!("split pool peaked at {} workers", pool.largest_pool_size());
    }
    println!("split: {}", split.stats().snapshot().format());
    println!("count: {}", count.stats().snapshot().format());

    runtime.shutdown();
    Ok(())
}
