//! Tactyl Physics - the rigid-body simulation tier
//!
//! Wraps the rapier3d solver behind [`solver::RigidSolver`] and drives it
//! from the common simulation loop via [`sim::PhysicsSim`]. Each tick:
//! pending contact forces from the haptics loop are applied at their contact
//! points, the solver integrates one step, joint motors run, and the
//! resulting poses and velocities of every dynamic object stream out to the
//! haptics and visual simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod sim;
pub mod solver;

pub use sim::PhysicsSim;
pub use solver::{MotorState, RigidSolver, SolverError};
