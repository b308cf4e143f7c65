use std::fs::File;
use std::io::{BufWriter, Write};

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::Tick;

/// Market aggregates at the end of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: Tick,
    pub insurer_cash: f64,
    pub insurer_contracts: usize,
    pub insurers_operational: usize,
    pub reinsurer_cash: f64,
    pub reinsurer_contracts: usize,
    pub reinsurers_operational: usize,
    pub catbonds: usize,
    pub market_premium: f64,
    pub reinsurance_market_premium: f64,
    /// Catastrophes fired since the start of the run.
    pub catastrophes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub records: Vec<TickRecord>,
}

/// End-of-run summary for console output.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub ticks: usize,
    pub catastrophes: u64,
    pub insurers_operational: usize,
    pub reinsurers_operational: usize,
    pub final_insurer_cash: f64,
    pub final_reinsurer_cash: f64,
    /// Lowest count of operational insurers seen in any tick.
    pub min_insurers_operational: usize,
    pub peak_catbonds: usize,
}

impl History {
    pub fn push(&mut self, record: TickRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&TickRecord> {
        self.records.last()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        let last = self.records.last()?;
        Some(RunSummary {
            ticks: self.records.len(),
            catastrophes: last.catastrophes,
            insurers_operational: last.insurers_operational,
            reinsurers_operational: last.reinsurers_operational,
            final_insurer_cash: last.insurer_cash,
            final_reinsurer_cash: last.reinsurer_cash,
            min_insurers_operational: self.records.iter().map(|r| r.insurers_operational).min().unwrap_or(0),
            peak_catbonds: self.records.iter().map(|r| r.catbonds).max().unwrap_or(0),
        })
    }

    /// One row per tick, header first.
    pub fn write_csv(&self, path: &str) -> Result<(), SimError> {
        let io_err = |source| SimError::Io { path: path.to_string(), source };
        let file = File::create(path).map_err(io_err)?;
        let mut w = BufWriter::new(file);
        self.write_rows(&mut w).map_err(io_err)?;
        w.flush().map_err(io_err)
    }

    fn write_rows(&self, w: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            w,
            "tick,insurer_cash,insurer_contracts,insurers_operational,reinsurer_cash,reinsurer_contracts,reinsurers_operational,catbonds,market_premium,reinsurance_market_premium,catastrophes"
        )?;
        for r in &self.records {
            writeln!(
                w,
                "{},{:.6},{},{},{:.6},{},{},{},{:.8},{:.8},{}",
                r.tick.0,
                r.insurer_cash,
                r.insurer_contracts,
                r.insurers_operational,
                r.reinsurer_cash,
                r.reinsurer_contracts,
                r.reinsurers_operational,
                r.catbonds,
                r.market_premium,
                r.reinsurance_market_premium,
                r.catastrophes,
            )?;
        }
        Ok(())
    }
}
