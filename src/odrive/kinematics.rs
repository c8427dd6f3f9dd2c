// Differential-drive inverse kinematics
// Converts a body twist (linear, angular) to left/right wheel velocities
// in encoder counts per second.

/// Wheel geometry for the base
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveGeometry {
    /// Distance between the two wheel contact points (meters)
    pub wheel_track: f32,
    /// Distance travelled per wheel revolution (meters)
    pub tyre_circumference: f32,
    /// Encoder counts per wheel revolution
    pub encoder_cpr: u32,
    /// Largest wheel speed ever commanded (counts/s)
    pub max_counts_per_s: f32,
}

/// Defaults for the reference base
pub const WHEEL_TRACK: f32 = 0.285; // meters
pub const TYRE_CIRCUMFERENCE: f32 = 0.341; // meters
/// Matches the provisioned controller velocity limit
pub const MAX_COUNTS_PER_S: f32 = 600_000.0;

impl DriveGeometry {
    pub fn new(encoder_cpr: u32) -> Self {
        Self {
            wheel_track: WHEEL_TRACK,
            tyre_circumference: TYRE_CIRCUMFERENCE,
            encoder_cpr,
            max_counts_per_s: MAX_COUNTS_PER_S,
        }
    }

    /// Encoder counts per meter of travel
    pub fn counts_per_meter(&self) -> f32 {
        self.encoder_cpr as f32 / self.tyre_circumference
    }
}

/// Wheel velocity setpoints (counts/s), in the caller's sign convention
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelVelocities {
    pub left: f32,
    pub right: f32,
}

impl WheelVelocities {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Convert a body twist to wheel velocities
///
/// # Arguments
/// * `linear` - Forward velocity in m/s (positive = forward)
/// * `angular` - Yaw rate in rad/s (positive = counter-clockwise)
pub fn twist_to_wheels(linear: f32, angular: f32, geometry: &DriveGeometry) -> WheelVelocities {
    let half_track = geometry.wheel_track / 2.0;
    let left_m_s = linear - angular * half_track;
    let right_m_s = linear + angular * half_track;

    let scale = geometry.counts_per_meter();
    let mut left = left_m_s * scale;
    let mut right = right_m_s * scale;

    // Saturate both wheels by the same factor so the turn radius is kept
    let peak = left.abs().max(right.abs());
    if peak > geometry.max_counts_per_s {
        let factor = geometry.max_counts_per_s / peak;
        left *= factor;
        right *= factor;
    }

    WheelVelocities { left, right }
}
