//! Tactyl World - scene model, message bus and simulation scheduler
//!
//! The pieces every simulation tier builds on:
//!
//! - [`bus`]: bounded per-simulation queues and the cross-simulation router
//! - [`scene`]: the object/constraint model with OSC verb routing
//! - [`simulation`]: the common worker loop (fixed-timestep pacing,
//!   queue draining, lifecycle)
//! - [`visual`]: the render-mirror simulation
//!
//! # Threading model
//!
//! Each simulation's scene is owned exclusively by its worker thread. All
//! cross-thread communication goes through the [`bus::Router`]; OSC dispatch
//! happens only while a worker drains its queue, so a scene never sees
//! concurrent mutation.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod scene;
pub mod simulation;
pub mod visual;

pub use bus::{BusCounters, Envelope, Origin, Router, SimMessage};
pub use scene::{Constraint, ConstraintKind, Object, Scene, SceneChange, Shape};
pub use simulation::{SimContext, SimHandle, SimRunner, Simulation};
pub use visual::{RenderFrame, RenderInstance, VisualSim};
