//! Vacuum/cryogenic stand supervision library.
//!
//! Continuous device state-supervision and closed-loop actuation for a
//! laboratory vacuum stand: declaratively-driven hardware state machines
//! behind port traits, with the device protocol layer kept outside.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  protocol drivers (serial/TCP)   sim bench   alert routing     │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  Supervisor engine (thread · wake cell · watchdog)     │    │
//! │  │  Manifold sequencing · Cryo level · Flow loop          │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

pub mod config;
pub mod control;
pub mod cryo;
pub mod error;
pub mod manifold;
pub mod ports;
pub mod sim;
pub mod supervisor;
