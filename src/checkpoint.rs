//! Snapshots of a running market and the replication archive.
//!
//! A [`Checkpoint`] is the whole [`Simulation`] as JSON: configuration, tick,
//! random stream, agents, contracts, ledgers, schedule and history. Loading
//! one and stepping on reproduces the uninterrupted run exactly.
//!
//! The [`ReplicationArchive`] is lighter: one NDJSON line per replication id
//! holding the catastrophe schedule and the random stream as they were right
//! after the schedule was drawn. A replicating run rebuilds everything else
//! from the configuration.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::info;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::events::EventScheduler;
use crate::simulation::{Simulation, seed_schedule};

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SimError + '_ {
    move |source| SimError::Io { path: path.display().to_string(), source }
}

// ── Checkpoint ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub simulation: Simulation,
}

impl Checkpoint {
    pub fn capture(simulation: &Simulation) -> Self {
        Checkpoint { simulation: simulation.clone() }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(io_error(path))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, self)?;
        w.flush().map_err(io_error(path))?;
        info!("checkpoint at {:?} written to {}", self.simulation.tick, path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error(path))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Hand back the simulation, provided it was built from `config`.
    pub fn resume(self, config: &SimulationConfig) -> Result<Simulation, SimError> {
        if &self.simulation.config != config {
            return Err(SimError::ReplayMismatch(format!(
                "checkpoint at {:?} was taken under a different configuration",
                self.simulation.tick
            )));
        }
        info!("resuming at {:?}", self.simulation.tick);
        Ok(self.simulation)
    }
}

// ── Replication archive ───────────────────────────────────────────────────────

/// Schedule and random stream of one recorded run, captured right after
/// the schedule was drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub replic_id: u64,
    pub scheduler: EventScheduler,
    pub rng: ChaCha20Rng,
}

#[derive(Debug, Clone)]
pub struct ReplicationArchive {
    path: PathBuf,
}

impl ReplicationArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ReplicationArchive { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ReplicationRecord) -> Result<(), SimError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, record)?;
        writeln!(w).map_err(io_error(&self.path))?;
        w.flush().map_err(io_error(&self.path))
    }

    /// The most recent record for `replic_id`. A missing archive counts as
    /// an archive without that id.
    pub fn restore(&self, replic_id: u64) -> Result<ReplicationRecord, SimError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(SimError::ReplicationNotFound(replic_id)),
            Err(e) => return Err(io_error(&self.path)(e)),
        };
        let mut found = None;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_error(&self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplicationRecord = serde_json::from_str(&line)?;
            if record.replic_id == replic_id {
                found = Some(record);
            }
        }
        found.ok_or(SimError::ReplicationNotFound(replic_id))
    }
}

/// Start a fresh run and archive its schedule under `replic_id`.
pub fn start_recording(config: SimulationConfig, archive: &ReplicationArchive, replic_id: u64) -> Result<Simulation, SimError> {
    let (scheduler, rng) = seed_schedule(&config)?;
    archive.append(&ReplicationRecord { replic_id, scheduler: scheduler.clone(), rng: rng.clone() })?;
    info!("replication {replic_id} recorded to {}", archive.path().display());
    Simulation::from_replay(config, scheduler, rng)
}

/// Rebuild a recorded run from the archive.
pub fn start_replicating(config: SimulationConfig, archive: &ReplicationArchive, replic_id: u64) -> Result<Simulation, SimError> {
    let record = archive.restore(replic_id)?;
    info!("replication {replic_id} restored from {}", archive.path().display());
    Simulation::from_replay(config, record.scheduler, record.rng)
}
