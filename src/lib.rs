//! Agent-based simulation of a catastrophe insurance market.
//!
//! Insurers write single-property risks, reinsurers and cat bonds take
//! excess-of-loss layers of insurers' category books, and a catastrophe
//! schedule drives claims through the chain. [`simulation::Simulation`] owns
//! the whole state and advances it one tick at a time.

pub mod catbond;
pub mod checkpoint;
pub mod config;
pub mod contract;
mod cycle;
pub mod error;
pub mod events;
pub mod firm;
pub mod history;
pub mod ledger;
pub mod market;
pub mod perils;
pub mod profile;
pub mod risk;
pub mod riskmodel;
pub mod simulation;
pub mod types;
