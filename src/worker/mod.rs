//! Worker units: isolated processes performing one job's feature extraction.
//!
//! - `protocol`: the single JSON-line message a unit sends back
//! - `spawner`: how the coordinator starts and observes units
//! - `runner`: what runs inside a unit

pub mod protocol;
pub mod runner;
pub mod spawner;

pub use protocol::WorkerMessage;
pub use runner::run_worker;
pub use spawner::{ProcessSpawner, SpawnParams, UnitOutcome, WorkerSpawner, WorkerUnit};
