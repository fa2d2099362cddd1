//! Tactyl Haptics - the force-feedback tier
//!
//! Runs the 1 kHz cursor loop: read the device pose, normalize it through
//! the adaptive workspace calibration, compute interaction forces with the
//! surface-proxy and potential-field algorithms, synthesize cursor dynamics
//! (virtual mass, grab spring, externally applied force overlay), send the
//! force to the device, and report contacts to the physics loop and
//! collision events to the peer.
//!
//! The device itself is behind the narrow [`device::HapticDevice`] trait;
//! [`device::SimulatedDevice`] stands in when no hardware is present.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cursor;
pub mod device;
pub mod proxy;
pub mod sim;
pub mod workspace;

pub use cursor::{grab_force, CursorDynamics, ExtraForce};
pub use device::{DeviceError, DeviceProbe, DeviceResult, HapticDevice, SimulatedDevice};
pub use proxy::{ContactInfo, ForceAlgorithm, PotentialField, SurfaceProxy};
pub use sim::HapticsSim;
pub use workspace::WorkspaceMap;
