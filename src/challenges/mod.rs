// Challenge detection, solving, and the transport/retry core used to get past anti-bot flows.

pub mod core;
pub mod detectors;
pub mod pipeline;
pub mod solvers;
