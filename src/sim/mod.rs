//! Frame workload driver
//!
//! Runs several rendering contexts against the shared pools, one frame at a time,
//! with a simulated GPU retiring each frame's fence after a fixed latency.

mod driver;

pub use driver::{SimConfig, SimReport, WorkloadConfig, run_simulation};
