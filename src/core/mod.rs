//! Scenario sequencing and host-side helpers
//!
//! - Local interface discovery for the iperf3 peer address
//! - Bounded local helper processes
//! - The RF test scenarios themselves
pub mod network;
pub mod scenario;
pub mod subprocess;
