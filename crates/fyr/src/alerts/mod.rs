//! Alert intake and correlation.

pub mod correlator;
pub mod intake;
pub mod types;

pub use correlator::{correlation_key, AlertCorrelator, BatchReport};
pub use intake::{should_investigate, AlertIntake, IntakeSummary};
pub use types::{AlertPayload, IncomingAlert};
