//! Response-time driven load shedding
//!
//! A slow "render" stage is flooded by a fast producer. Its response time
//! controller shrinks the admission threshold until the 90th percentile
//! batch latency sits near the target; excess requests are shed at the sink.
//!
//! Usage: RUST_LOG=stage_runtime=debug cargo run --example load_shedding --release

use stage_runtime::{
    ControllerConfig, Result as StageResult, Runtime, RuntimeConfig, SorterPolicy, StageBuilder,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Request {
    id: u64,
    issued: Instant,
}

fn main() -> StageResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_pairs([
        ("global.threadPool.blockTime", "50"),
        ("stages.render.threadPool.initialThreads", "2"),
        ("stages.render.threadPool.maxThreads", "2"),
    ])?;
    let runtime = Runtime::new(config);

    let mut controller = ControllerConfig::queue_threshold(Duration::from_millis(20));
    controller.recalculation_window = 20;
    controller.max_value = 256.0;

    let render = runtime.create_stage(
        StageBuilder::new("render", |requests: Vec<Request>| -> StageResult<()> {
            for request in &requests {
                // Simulated work per request
                thread::sleep(Duration::from_millis(2));
                if request.id % 1000 == 0 {
                    info!(
                        id = request.id,
                        waited_ms = request.issued.elapsed().as_millis() as u64,
                        "Rendered"
                    );
                }
            }
            Ok(())
        })
        .response_time_controller(controller)
        .sorter(SorterPolicy::Throttled {
            max_batch: 8,
            max_outstanding: None,
        }),
    )?;

    let started = Instant::now();
    let mut shed = 0u64;
    let mut id = 0u64;
    while started.elapsed() < Duration::from_secs(5) {
        for _ in 0..50 {
            id += 1;
            let request = Request {
                id,
                issued: Instant::now(),
            };
            if !render.sink().enqueue_lossy(request) {
                shed += 1;
            }
        }
        thread::sleep(Duration::from_millis(5));
    }

    let controller = render.controller().map(|c| c.value()).unwrap_or_default();
    info!(issued = id, shed, threshold = controller, "Producer finished");
    println!("{}", render.stats().snapshot().format());

    runtime.shutdown();
    Ok(())
}
