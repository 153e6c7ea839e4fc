//! Bakery workflow orchestration.
//!
//! This crate holds the ordered stage runner used by the installer. Callers
//! provide the concrete state type and the stages; the runner guarantees order,
//! stops at the first failure and names the stage that failed.

pub mod stage_runner;
