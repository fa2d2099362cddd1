//! Runtime configuration for the simulator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default UDP port for the physics endpoint.
pub const DEFAULT_PHYSICS_PORT: u16 = 7774;
/// Default UDP port for the haptics endpoint.
pub const DEFAULT_HAPTICS_PORT: u16 = 7775;
/// Default UDP port for the visual endpoint.
pub const DEFAULT_VISUAL_PORT: u16 = 7776;
/// Default peer for outgoing events.
pub const DEFAULT_PEER: &str = "127.0.0.1:7770";

/// Configuration for the three simulation loops and their endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    /// Bind address for incoming OSC (shared by all endpoints).
    pub bind_host: String,

    /// UDP port of the physics endpoint.
    pub physics_port: u16,

    /// UDP port of the haptics endpoint.
    pub haptics_port: u16,

    /// UDP port of the visual endpoint.
    pub visual_port: u16,

    /// Peer address for outgoing events (collisions, force magnitude).
    pub peer: String,

    /// Physics timestep in milliseconds.
    pub physics_timestep_ms: u64,

    /// Haptics timestep in milliseconds.
    pub haptics_timestep_ms: u64,

    /// Visual timestep in milliseconds.
    pub visual_timestep_ms: u64,

    /// Gravity vector applied by the physics simulation.
    pub gravity: [f32; 3],

    /// Capacity of each simulation's incoming queue.
    pub queue_capacity: usize,
}

impl SimConfig {
    /// Physics timestep as a [`Duration`].
    #[must_use]
    pub fn physics_timestep(&self) -> Duration {
        Duration::from_millis(self.physics_timestep_ms)
    }

    /// Haptics timestep as a [`Duration`].
    #[must_use]
    pub fn haptics_timestep(&self) -> Duration {
        Duration::from_millis(self.haptics_timestep_ms)
    }

    /// Visual timestep as a [`Duration`].
    #[must_use]
    pub fn visual_timestep(&self) -> Duration {
        Duration::from_millis(self.visual_timestep_ms)
    }

    /// Number of haptic ticks an externally applied cursor force persists.
    ///
    /// Sized so that one or two physics steps can consume the force before
    /// the device drops back to zero if the network stalls.
    #[must_use]
    pub fn extra_force_ticks(&self) -> u32 {
        let ticks = (self.physics_timestep_ms * 2).div_ceil(self.haptics_timestep_ms);
        ticks.max(1) as u32
    }

    /// Bind address for a given port.
    #[must_use]
    pub fn endpoint(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host, port)
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            physics_port: DEFAULT_PHYSICS_PORT,
            haptics_port: DEFAULT_HAPTICS_PORT,
            visual_port: DEFAULT_VISUAL_PORT,
            peer: DEFAULT_PEER.to_string(),
            physics_timestep_ms: 10,
            haptics_timestep_ms: 1,
            visual_timestep_ms: 33,
            gravity: [0.0, 0.0, 0.0],
            queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let config = SimConfig::default();
        assert_eq!(config.physics_port, 7774);
        assert_eq!(config.haptics_port, 7775);
        assert_eq!(config.visual_port, 7776);
    }

    #[test]
    fn test_extra_force_ticks() {
        let config = SimConfig::default();
        // 10 ms * 2 / 1 ms = 20 haptic ticks
        assert_eq!(config.extra_force_ticks(), 20);

        let slow = SimConfig {
            physics_timestep_ms: 5,
            haptics_timestep_ms: 2,
            ..Default::default()
        };
        assert_eq!(slow.extra_force_ticks(), 5);
    }

    #[test]
    fn test_endpoint_format() {
        let config = SimConfig::default();
        assert_eq!(config.endpoint(config.physics_port), "0.0.0.0:7774");
    }
}
