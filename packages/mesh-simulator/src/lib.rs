//! Simulation harness for the meshloc mesh: in-memory serial hub, RF
//! propagation model, embedded-node construction, and scenario presets.
//! The binary in `main.rs` drives one scenario end to end; the integration
//! tests drive the protocol edge cases.

pub mod hub;
pub mod rf;
pub mod scenarios;
pub mod world;
