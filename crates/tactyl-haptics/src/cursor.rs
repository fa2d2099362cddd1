//! Cursor dynamics: virtual mass, grab spring, extra-force overlay.

use tactyl_core::math::Vec3;

/// Stiffness of the cursor mass-spring and the grab spring.
const SPRING_STIFFNESS: f32 = 10.0;
/// Damping of the cursor mass-spring and the grab spring.
const SPRING_DAMPING: f32 = 0.001;
/// Gain applied to the mass-spring force before it reaches the device.
const MASS_FORCE_GAIN: f32 = 10.0;

/// A virtual mass dragged behind the device on a spring-damper.
///
/// With zero mass the point simply tracks the device and produces no force.
#[derive(Clone, Debug, Default)]
pub struct CursorDynamics {
    mass: f32,
    mass_pos: Vec3,
    mass_vel: Vec3,
    last_pos_diff: Vec3,
}

impl CursorDynamics {
    /// Create a massless cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the virtual mass. Zero or negative turns the effect off.
    pub fn set_mass(&mut self, mass: f32) {
        self.mass = mass;
    }

    /// Current virtual mass.
    #[must_use]
    pub fn mass(&self) -> f32 {
        self.mass
    }

    /// Advance the mass by one tick and return the force to add to the
    /// device.
    pub fn force(&mut self, device_pos: Vec3, dt: f32) -> Vec3 {
        if dt <= 0.0 {
            return Vec3::zeros();
        }

        // Massless: track the device so a later mass change starts clean.
        if self.mass <= 0.0 {
            self.mass_vel = (device_pos - self.mass_pos) / dt;
            self.mass_pos = device_pos;
            return Vec3::zeros();
        }

        let pos_diff = device_pos - self.mass_pos;
        let spring_vel = (pos_diff - self.last_pos_diff) / dt;
        self.last_pos_diff = pos_diff;

        let force = -pos_diff * SPRING_STIFFNESS - spring_vel * SPRING_DAMPING;

        self.mass_pos += self.mass_vel * dt;
        self.mass_vel -= force / self.mass * dt;

        force * MASS_FORCE_GAIN
    }
}

/// Spring pulling the cursor toward a grabbed object.
#[must_use]
pub fn grab_force(cursor_pos: Vec3, cursor_vel: Vec3, object_pos: Vec3) -> Vec3 {
    (cursor_pos - object_pos) * -SPRING_STIFFNESS + cursor_vel * -SPRING_DAMPING
}

/// An externally applied device force with a tick-bounded lifetime.
///
/// The timeout drops the motors back to zero if the network stalls while a
/// remote servo loop is driving the cursor.
#[derive(Clone, Debug, Default)]
pub struct ExtraForce {
    force: Vec3,
    remaining: u32,
}

impl ExtraForce {
    /// Create an inactive overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the overlay for a bounded number of ticks.
    pub fn set(&mut self, force: Vec3, ticks: u32) {
        self.force = force;
        self.remaining = ticks;
    }

    /// The overlay force for this tick; decrements the lifetime.
    pub fn take(&mut self) -> Vec3 {
        if self.remaining == 0 {
            return Vec3::zeros();
        }
        self.remaining -= 1;
        self.force
    }

    /// Whether the overlay is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }
}
