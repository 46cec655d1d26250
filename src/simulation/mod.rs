// src/simulation/mod.rs

//! Offline stand-ins: an in-memory ledger for demo mode and tests, and the
//! randomness sources fed to the trade loop.

pub mod ledger;
pub mod random;

pub use ledger::{SimulatedLedger, SimulatedTransfer};
pub use random::{SequenceRandom, ThreadRandom};
