use catmarket::config::SimulationConfig;
use catmarket::profile::ReinsuranceProfile;
use catmarket::simulation::Simulation;
use catmarket::types::{ContractId, FirmId};

pub struct Scenario {
    pub insurers: usize,
    pub reinsurers: usize,
    pub no_risks: usize,
}

pub const SMALL: Scenario = Scenario { insurers: 5, reinsurers: 1, no_risks: 2_000 };

pub const MEDIUM: Scenario = Scenario { insurers: 20, reinsurers: 4, no_risks: 20_000 };

pub const LARGE: Scenario = Scenario { insurers: 80, reinsurers: 16, no_risks: 80_000 };

pub fn config(scenario: &Scenario, seed: u64, ticks: u64) -> SimulationConfig {
    let mut config = SimulationConfig::canonical();
    config.seed = seed;
    config.max_time = ticks;
    config.insurers.count = scenario.insurers;
    config.reinsurers.count = scenario.reinsurers;
    config.no_risks = scenario.no_risks;
    config
}

/// A simulation stepped past its warm-up, so books and layers are populated.
pub fn warmed_simulation(scenario: &Scenario, seed: u64, warmup: u64, ticks: u64) -> Simulation {
    let mut sim = Simulation::from_config(config(scenario, seed, warmup + ticks))
        .unwrap_or_else(|e| panic!("bench config must be valid: {e}"));
    for _ in 0..warmup {
        sim.step().unwrap_or_else(|e| panic!("warm-up failed: {e}"));
    }
    sim
}

/// A profile whose category 0 band is covered by `layers` disjoint layers
/// with small gaps between them.
pub fn fragmented_profile(layers: usize) -> ReinsuranceProfile {
    let mut profile = ReinsuranceProfile::new(FirmId(0), 4, 0.25, 1.0);
    let width = 0.75 / layers as f64;
    for i in 0..layers {
        let lower = 0.25 + i as f64 * width;
        let upper = lower + 0.8 * width;
        profile
            .add(0, ContractId(i as u64), lower, upper, lower * 10_000.0, upper * 10_000.0)
            .unwrap_or_else(|e| panic!("fixture layers are disjoint: {e}"));
    }
    profile
}
