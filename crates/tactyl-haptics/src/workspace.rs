//! Adaptive workspace calibration.
//!
//! Maps the observed envelope of raw device positions onto the normalized
//! `[-1, 1]^3` cube. The envelope grows as the device explores; the mapping
//! is recomputed on every sample.

use tactyl_core::math::Vec3;

/// Running calibration of the device workspace.
#[derive(Clone, Debug, Default)]
pub struct WorkspaceMap {
    min: Vec3,
    max: Vec3,
    seeded: bool,
}

impl WorkspaceMap {
    /// Create an uncalibrated map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the observed envelope; the next sample reseeds it.
    pub fn reset(&mut self) {
        self.seeded = false;
    }

    /// Fold a raw device position into the envelope and return its
    /// normalized position.
    ///
    /// An axis the device has not yet moved along has zero span; it maps
    /// with unit scale around the envelope center.
    pub fn map(&mut self, raw: Vec3) -> Vec3 {
        if !self.seeded {
            self.min = raw;
            self.max = raw;
            self.seeded = true;
        }

        let mut out = Vec3::zeros();
        for i in 0..3 {
            if raw[i] < self.min[i] {
                self.min[i] = raw[i];
            }
            if raw[i] > self.max[i] {
                self.max[i] = raw[i];
            }

            let span = self.max[i] - self.min[i];
            let scale = if span != 0.0 { 2.0 / span } else { 1.0 };
            let offset = -(self.max[i] + self.min[i]) / 2.0;
            out[i] = (raw[i] + offset) * scale;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_maps_to_center() {
        let mut ws = WorkspaceMap::new();
        let mapped = ws.map(Vec3::new(3.0, -2.0, 0.5));
        assert!(mapped.norm() < 1e-6);
    }

    #[test]
    fn test_known_envelope_maps_to_unit_cube() {
        let mut ws = WorkspaceMap::new();
        ws.map(Vec3::new(-2.0, -2.0, -2.0));
        ws.map(Vec3::new(2.0, 2.0, 2.0));

        let mapped = ws.map(Vec3::new(0.0, 2.0, -2.0));
        assert!(mapped.x.abs() < 1e-6);
        assert!((mapped.y - 1.0).abs() < 1e-6);
        assert!((mapped.z + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_all_samples_stay_inside_cube() {
        let mut ws = WorkspaceMap::new();
        let poses = [
            Vec3::new(0.1, 5.0, -3.0),
            Vec3::new(-4.0, 2.0, 8.0),
            Vec3::new(7.0, -1.0, 0.0),
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.5, 2.5, 2.5),
        ];
        for pose in poses {
            let mapped = ws.map(pose);
            for i in 0..3 {
                assert!(mapped[i] >= -1.0 - 1e-6 && mapped[i] <= 1.0 + 1e-6);
            }
        }
    }

    #[test]
    fn test_reset_reseeds_envelope() {
        let mut ws = WorkspaceMap::new();
        ws.map(Vec3::new(-10.0, 0.0, 0.0));
        ws.map(Vec3::new(10.0, 0.0, 0.0));

        ws.reset();
        let mapped = ws.map(Vec3::new(100.0, 0.0, 0.0));
        // Fresh envelope: the first sample is its own center again.
        assert!(mapped.norm() < 1e-6);
    }
}
