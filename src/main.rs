use std::path::Path;
use std::str::FromStr;

use catmarket::checkpoint::{self, Checkpoint, ReplicationArchive};
use catmarket::config::SimulationConfig;
use catmarket::error::SimError;
use catmarket::history::RunSummary;
use catmarket::simulation::Simulation;
use log::error;

struct Options {
    seed: Option<u64>,
    ticks: Option<u64>,
    config_path: Option<String>,
    output_dir: String,
    runs: Option<u64>,
    replic_id: Option<u64>,
    replicating: bool,
    archive_path: Option<String>,
    checkpoint_every: Option<u64>,
    resume_path: Option<String>,
    quiet: bool,
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    args.get(i)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        seed: None,
        ticks: None,
        config_path: None,
        output_dir: ".".to_string(),
        runs: None,
        replic_id: None,
        replicating: false,
        archive_path: None,
        checkpoint_every: None,
        resume_path: None,
        quiet: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" => {
                i += 1;
                opts.seed = Some(value(args, i, "--seed")?);
            }
            "--ticks" => {
                i += 1;
                opts.ticks = Some(value(args, i, "--ticks")?);
            }
            "--config" => {
                i += 1;
                opts.config_path = Some(value(args, i, "--config")?);
            }
            "--output-dir" => {
                i += 1;
                opts.output_dir = value(args, i, "--output-dir")?;
            }
            "--runs" => {
                i += 1;
                opts.runs = Some(value(args, i, "--runs")?);
            }
            "--replicid" => {
                i += 1;
                opts.replic_id = Some(value(args, i, "--replicid")?);
            }
            "--replicating" => opts.replicating = true,
            "--archive" => {
                i += 1;
                opts.archive_path = Some(value(args, i, "--archive")?);
            }
            "--checkpoint-every" => {
                i += 1;
                opts.checkpoint_every = Some(value(args, i, "--checkpoint-every")?);
            }
            "--resume" => {
                i += 1;
                opts.resume_path = Some(value(args, i, "--resume")?);
            }
            "--quiet" => opts.quiet = true,
            other => return Err(format!("unknown argument {other}")),
        }
        i += 1;
    }
    if opts.replicating && opts.replic_id.is_none() {
        return Err("--replicating requires --replicid".to_string());
    }
    if opts.runs.is_some() && (opts.replic_id.is_some() || opts.resume_path.is_some()) {
        return Err("--runs cannot be combined with --replicid or --resume".to_string());
    }
    Ok(opts)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            error!("{msg}");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(&opts) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(opts: &Options) -> Result<(), SimError> {
    let mut base_config = match &opts.config_path {
        Some(path) => SimulationConfig::from_json_file(path)?,
        None => SimulationConfig::canonical(),
    };
    if let Some(seed) = opts.seed {
        base_config.seed = seed;
    }
    if let Some(ticks) = opts.ticks {
        base_config.max_time = ticks;
    }
    let dir = opts.output_dir.as_str();
    std::fs::create_dir_all(dir).map_err(|source| SimError::Io { path: dir.to_string(), source })?;

    if let Some(n) = opts.runs {
        use rayon::prelude::*;

        let start_seed = base_config.seed;
        let summaries: Vec<(u64, Option<RunSummary>)> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut config = base_config.clone();
                config.seed = start_seed + i;
                let seed = config.seed;
                let sim = Simulation::from_config(config)?;
                finish(sim, opts, dir).map(|summary| (seed, summary))
            })
            .collect::<Result<_, SimError>>()?;
        if !opts.quiet {
            print_header();
            for (seed, summary) in &summaries {
                if let Some(summary) = summary {
                    print_summary(*seed, summary);
                }
            }
        }
        return Ok(());
    }

    let archive = ReplicationArchive::new(
        opts.archive_path.clone().unwrap_or_else(|| format!("{dir}/replications.ndjson")),
    );
    let seed = base_config.seed;
    let sim = match (&opts.resume_path, opts.replic_id) {
        (Some(path), _) => Checkpoint::load(path)?.resume(&base_config)?,
        (None, Some(id)) if opts.replicating => checkpoint::start_replicating(base_config, &archive, id)?,
        (None, Some(id)) => checkpoint::start_recording(base_config, &archive, id)?,
        (None, None) => Simulation::from_config(base_config)?,
    };
    let summary = finish(sim, opts, dir)?;
    if !opts.quiet
        && let Some(summary) = summary
    {
        print_header();
        print_summary(seed, &summary);
    }
    Ok(())
}

/// Step to the horizon, checkpointing on schedule, then write the history.
fn finish(mut sim: Simulation, opts: &Options, dir: &str) -> Result<Option<RunSummary>, SimError> {
    let seed = sim.config.seed;
    match opts.checkpoint_every.filter(|&every| every > 0) {
        Some(every) => {
            let path = Path::new(dir).join(format!("checkpoint_seed_{seed}.json"));
            while !sim.is_finished() {
                sim.step()?;
                if sim.tick.0 % every == 0 {
                    Checkpoint::capture(&sim).save(&path)?;
                }
            }
        }
        None => sim.run()?,
    }
    sim.history.write_csv(&format!("{dir}/history_seed_{seed}.csv"))?;
    Ok(sim.history.summary())
}

fn print_header() {
    println!(
        "{:>8} | {:>6} | {:>6} | {:>9} | {:>9} | {:>14} | {:>14} | {:>7}",
        "Seed", "Ticks", "Cats#", "Insurers", "Reinsur.", "InsurerCash", "ReinsurerCash", "Bonds^"
    );
    println!("{}", "-".repeat(8 + 3 + 6 + 3 + 6 + 3 + 9 + 3 + 9 + 3 + 14 + 3 + 14 + 3 + 7));
}

fn print_summary(seed: u64, s: &RunSummary) {
    println!(
        "{:>8} | {:>6} | {:>6} | {:>4} (≥{:>2}) | {:>9} | {:>14.0} | {:>14.0} | {:>7}",
        seed,
        s.ticks,
        s.catastrophes,
        s.insurers_operational,
        s.min_insurers_operational,
        s.reinsurers_operational,
        s.final_insurer_cash,
        s.final_reinsurer_cash,
        s.peak_catbonds,
    );
}
