//! Haptic device interface.
//!
//! The actual device driver is an external collaborator; the simulation
//! talks to it through [`HapticDevice`] only: read a 3-D pose, write a 3-D
//! force. [`SimulatedDevice`] stands in for hardware during development and
//! tests, replaying scripted poses and recording the forces it is sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use tactyl_core::math::Vec3;

/// Errors from the haptic device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device could be opened
    #[error("No haptic device available: {0}")]
    Unavailable(String),

    /// An I/O operation failed
    #[error("Device I/O failed: {0}")]
    Io(String),

    /// The device went away mid-session
    #[error("Device disconnected")]
    Disconnected,
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// A force-feedback input device.
pub trait HapticDevice: Send {
    /// Open communication with the device.
    fn open(&mut self) -> DeviceResult<()>;

    /// Read the current device position.
    fn read_pose(&mut self) -> DeviceResult<Vec3>;

    /// Send a force to the device motors.
    fn write_force(&mut self, force: Vec3) -> DeviceResult<()>;

    /// Whether the driver paces the loop itself. A self-paced device makes
    /// the haptics simulation opt out of self-timing.
    fn self_paced(&self) -> bool {
        false
    }

    /// Model name for logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Simulated Device
// ============================================================================

#[derive(Debug, Default)]
struct SimState {
    pose: Vec3,
    script: VecDeque<Vec3>,
    last_force: Vec3,
    forces: Vec<Vec3>,
    fail: bool,
}

/// A software stand-in for a haptic device.
///
/// Poses come from a script (falling back to the last pose when the script
/// runs dry); every force written is recorded. The paired [`DeviceProbe`]
/// drives and inspects the device from outside the simulation thread.
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    opened: bool,
}

impl SimulatedDevice {
    /// Create a simulated device and its probe.
    #[must_use]
    pub fn new() -> (Self, DeviceProbe) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: Arc::clone(&state),
                opened: false,
            },
            DeviceProbe { state },
        )
    }
}

impl HapticDevice for SimulatedDevice {
    fn open(&mut self) -> DeviceResult<()> {
        let state = self.state.lock().map_err(|_| DeviceError::Disconnected)?;
        if state.fail {
            return Err(DeviceError::Unavailable("simulated failure".to_string()));
        }
        drop(state);
        self.opened = true;
        Ok(())
    }

    fn read_pose(&mut self) -> DeviceResult<Vec3> {
        let mut state = self.state.lock().map_err(|_| DeviceError::Disconnected)?;
        if state.fail {
            return Err(DeviceError::Disconnected);
        }
        if let Some(next) = state.script.pop_front() {
            state.pose = next;
        }
        Ok(state.pose)
    }

    fn write_force(&mut self, force: Vec3) -> DeviceResult<()> {
        let mut state = self.state.lock().map_err(|_| DeviceError::Disconnected)?;
        if state.fail {
            return Err(DeviceError::Disconnected);
        }
        state.last_force = force;
        state.forces.push(force);
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// External handle for driving a [`SimulatedDevice`].
pub struct DeviceProbe {
    state: Arc<Mutex<SimState>>,
}

impl DeviceProbe {
    /// Set the pose the device reports from now on.
    pub fn set_pose(&self, pose: Vec3) {
        if let Ok(mut state) = self.state.lock() {
            state.pose = pose;
        }
    }

    /// Queue poses to be reported one per read.
    pub fn queue_poses(&self, poses: &[Vec3]) {
        if let Ok(mut state) = self.state.lock() {
            state.script.extend(poses.iter().copied());
        }
    }

    /// The most recent force written to the device.
    #[must_use]
    pub fn last_force(&self) -> Vec3 {
        self.state.lock().map(|s| s.last_force).unwrap_or_default()
    }

    /// All forces written so far.
    #[must_use]
    pub fn forces(&self) -> Vec<Vec3> {
        self.state.lock().map(|s| s.forces.clone()).unwrap_or_default()
    }

    /// Make every subsequent device operation fail.
    pub fn fail(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_poses_then_hold() {
        let (mut device, probe) = SimulatedDevice::new();
        device.open().unwrap();
        probe.queue_poses(&[Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 0.0, 0.0)]);

        assert!((device.read_pose().unwrap().x - 1.0).abs() < 1e-6);
        assert!((device.read_pose().unwrap().x - 2.0).abs() < 1e-6);
        // Script exhausted: the last pose holds.
        assert!((device.read_pose().unwrap().x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_forces_are_recorded() {
        let (mut device, probe) = SimulatedDevice::new();
        device.open().unwrap();
        device.write_force(Vec3::new(0.0, 0.0, 1.0)).unwrap();
        device.write_force(Vec3::new(0.0, 0.0, 2.0)).unwrap();

        assert_eq!(probe.forces().len(), 2);
        assert!((probe.last_force().z - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_failure_propagates() {
        let (mut device, probe) = SimulatedDevice::new();
        device.open().unwrap();
        probe.fail();
        assert!(device.read_pose().is_err());
        assert!(device.write_force(Vec3::zeros()).is_err());
    }
}
