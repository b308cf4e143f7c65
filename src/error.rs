use thiserror::Error;

use crate::types::{ContractId, FirmId, Tick};

/// Problems detected while building or validating a [`crate::config::SimulationConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown reinsurance type {0:?} (expected \"non-proportional\" or \"proportional\")")]
    UnknownReinsuranceType(String),

    #[error("invalid bounds for {field}: {reason}")]
    InvalidBounds { field: &'static str, reason: String },

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Every fatal condition the engine can hit. Nothing here is retried: the
/// run is deterministic given its seed, so each variant signals a bug or a
/// corrupt input rather than a transient fault.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("stale event schedule: category {category} still holds event at {head:?}, now {now:?}")]
    StaleSchedule { category: usize, head: Tick, now: Tick },

    #[error("money supply exhausted at {time:?}: {available} available, {requested} requested")]
    MoneySupplyExhausted { time: Tick, available: f64, requested: f64 },

    #[error(
        "overlapping tranche for firm {firm:?} category {category}: [{lower}, {upper}) collides with contract {existing:?}"
    )]
    OverlappingTranche {
        firm: FirmId,
        category: usize,
        lower: f64,
        upper: f64,
        existing: ContractId,
    },

    #[error("tranche [{lower}, {upper}) for firm {firm:?} category {category} lies outside band [{band_lower}, {band_upper}]")]
    TrancheOutOfBand {
        firm: FirmId,
        category: usize,
        lower: f64,
        upper: f64,
        band_lower: f64,
        band_upper: f64,
    },

    #[error("replay mismatch: {0}")]
    ReplayMismatch(String),

    #[error("replication {0} not found in archive")]
    ReplicationNotFound(u64),

    #[error("unknown contract {0:?}")]
    UnknownContract(ContractId),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
