//! pirf drives RF compliance test scenarios on a Raspberry Pi through its
//! serial console.
//!
//! The protocol layer logs in over the console and runs shell commands with
//! completion markers. The core layer sequences the scenarios and the local
//! helpers (iperf3, interface discovery) that pair with them.

#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod core;
pub mod protocol;

pub use protocol::error::{Error, Result};
