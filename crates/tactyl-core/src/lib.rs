//! Tactyl Core - shared types for the OSC-controlled dynamics simulator
//!
//! This crate provides the foundational pieces shared by every simulation
//! tier of the Tactyl platform:
//!
//! - [`math`]: vector/matrix aliases and small numeric helpers
//! - [`value`]: the typed value & property layer (per-property target
//!   simulation, checked property values)
//! - [`osc`]: OSC message wrappers plus the UDP listener/sender transport
//! - [`config`]: runtime configuration with serde support
//! - [`error`]: error types shared across the workspace
//!
//! # Example
//!
//! ```rust
//! use tactyl_core::osc::{OscArg, OscMessage};
//!
//! let msg = OscMessage::new(
//!     "/world/s1/position",
//!     vec![OscArg::Float(0.0), OscArg::Float(0.0), OscArg::Float(0.1)],
//! );
//! assert_eq!(msg.typetag(), "fff");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod math;
pub mod osc;
pub mod value;

pub use config::SimConfig;
pub use error::{OscError, OscResult};
pub use math::{Color, Mat3, Vec3};
pub use osc::{OscArg, OscListener, OscMessage, OscSender};
pub use value::{PropertyKind, PropertyValue, SimSet, SimTag};
