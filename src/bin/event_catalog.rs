//! Print the catastrophe timeline a seed produces, one NDJSON line per
//! event on stdout, with a per-category summary on stderr.
//!
//! Usage: event_catalog [SEED] [MAX_TIME]

use std::env;
use std::io::{BufWriter, Write};

use catmarket::config::SimulationConfig;
use catmarket::error::SimError;
use catmarket::simulation::seed_schedule;
use log::error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), SimError> {
    let mut config = SimulationConfig::canonical();
    let mut args = env::args().skip(1);
    if let Some(seed) = args.next().and_then(|s| s.parse().ok()) {
        config.seed = seed;
    }
    if let Some(max_time) = args.next().and_then(|s| s.parse().ok()) {
        config.max_time = max_time;
    }

    let (scheduler, _) = seed_schedule(&config)?;
    let events = scheduler.timeline();

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let io_err = |source| SimError::Io { path: "<stdout>".to_string(), source };
    for event in &events {
        serde_json::to_writer(&mut out, event)?;
        writeln!(out).map_err(io_err)?;
    }
    out.flush().map_err(io_err)?;

    eprintln!("\n=== Catastrophes by category (seed {}, {} ticks) ===", config.seed, config.max_time);
    eprintln!("{:>8} | {:>6} | {:>10}", "Category", "Count", "MeanGap");
    for category in 0..config.no_categories {
        let times: Vec<u64> = events.iter().filter(|e| e.category == category).map(|e| e.time.0).collect();
        let mean_gap = if times.len() > 1 {
            (times[times.len() - 1] - times[0]) as f64 / (times.len() - 1) as f64
        } else {
            f64::NAN
        };
        eprintln!("{category:>8} | {:>6} | {mean_gap:>10.1}", times.len());
    }
    eprintln!("Total: {}", events.len());
    Ok(())
}
