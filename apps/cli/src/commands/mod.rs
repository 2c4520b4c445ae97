//! Command implementations for the Cadence CLI.

pub mod phases;
pub mod providers;
pub mod run;
