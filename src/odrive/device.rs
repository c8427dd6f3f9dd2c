// Device-facing types and the trait the axis controller drives
//
// Numeric values follow the ODrive 0.4.x firmware enumerations.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::Result;

/// Physical axis on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisId {
    Axis0,
    Axis1,
}

impl AxisId {
    /// Both axes, in the order every two-axis sequence visits them
    pub const BOTH: [AxisId; 2] = [AxisId::Axis0, AxisId::Axis1];

    pub fn index(self) -> u8 {
        match self {
            AxisId::Axis0 => 0,
            AxisId::Axis1 => 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(AxisId::Axis0),
            1 => Some(AxisId::Axis1),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            AxisId::Axis0 => AxisId::Axis1,
            AxisId::Axis1 => AxisId::Axis0,
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "axis{}", self.index())
    }
}

/// Axis lifecycle states the controller requests
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisState {
    Idle = 1,
    FullCalibrationSequence = 3,
    EncoderIndexSearch = 6,
    ClosedLoopControl = 8,
}

impl AxisState {
    /// Decode a raw firmware state; states the controller never requests map to `None`
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(AxisState::Idle),
            3 => Some(AxisState::FullCalibrationSequence),
            6 => Some(AxisState::EncoderIndexSearch),
            8 => Some(AxisState::ClosedLoopControl),
            _ => None,
        }
    }
}

/// Controller input modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    VelocityControl = 2,
    PositionControl = 3,
}

impl ControlMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            2 => Some(ControlMode::VelocityControl),
            3 => Some(ControlMode::PositionControl),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorType {
    HighCurrent = 0,
    Gimbal = 2,
}

/// Error bitmasks of one axis and its sub-units (0 = no error)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisErrors {
    pub axis: u32,
    pub motor: u32,
    pub encoder: u32,
    pub controller: u32,
}

impl AxisErrors {
    pub fn is_clear(&self) -> bool {
        self.axis == 0 && self.motor == 0 && self.encoder == 0 && self.controller == 0
    }
}

impl fmt::Display for AxisErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "axis error 0x{:x}, motor error 0x{:x}, encoder error 0x{:x}, controller error 0x{:x}",
            self.axis, self.motor, self.encoder, self.controller
        )
    }
}

/// Hardware and firmware identification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardInfo {
    pub hw_version_major: u8,
    pub hw_version_minor: u8,
    pub hw_version_variant: u8,
    pub fw_version_major: u8,
    pub fw_version_minor: u8,
    pub fw_version_revision: u8,
    pub fw_version_unreleased: bool,
    pub serial_number: u64,
}

impl fmt::Display for BoardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hardware v{}.{}-{}, firmware v{}.{}.{}{}",
            self.hw_version_major,
            self.hw_version_minor,
            self.hw_version_variant,
            self.fw_version_major,
            self.fw_version_minor,
            self.fw_version_revision,
            if self.fw_version_unreleased { "-dev" } else { "" }
        )
    }
}

/// Persistent per-axis configuration values written during provisioning
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisParam {
    CurrentLim(f32),
    PolePairs(u32),
    VelLimit(f32),
    MotorType(MotorType),
    CalibrationCurrent(f32),
    MotorPreCalibrated(bool),
    EncoderCpr(u32),
    EncoderBandwidth(f32),
    EncoderUseIndex(bool),
    EncoderZeroCountOnFindIdx(bool),
    EncoderPreCalibrated(bool),
    StartupEncoderIndexSearch(bool),
    StartupEncoderOffsetCalibration(bool),
    StartupClosedLoopControl(bool),
    VelGain(f32),
    VelIntegratorGain(f32),
    PosGain(f32),
}

impl AxisParam {
    /// Property path relative to the axis object
    pub fn path(&self) -> &'static str {
        match self {
            AxisParam::CurrentLim(_) => "motor.config.current_lim",
            AxisParam::PolePairs(_) => "motor.config.pole_pairs",
            AxisParam::VelLimit(_) => "controller.config.vel_limit",
            AxisParam::MotorType(_) => "motor.config.motor_type",
            AxisParam::CalibrationCurrent(_) => "motor.config.calibration_current",
            AxisParam::MotorPreCalibrated(_) => "motor.config.pre_calibrated",
            AxisParam::EncoderCpr(_) => "encoder.config.cpr",
            AxisParam::EncoderBandwidth(_) => "encoder.config.bandwidth",
            AxisParam::EncoderUseIndex(_) => "encoder.config.use_index",
            AxisParam::EncoderZeroCountOnFindIdx(_) => "encoder.config.zero_count_on_find_idx",
            AxisParam::EncoderPreCalibrated(_) => "encoder.config.pre_calibrated",
            AxisParam::StartupEncoderIndexSearch(_) => "config.startup_encoder_index_search",
            AxisParam::StartupEncoderOffsetCalibration(_) => {
                "config.startup_encoder_offset_calibration"
            }
            AxisParam::StartupClosedLoopControl(_) => "config.startup_closed_loop_control",
            AxisParam::VelGain(_) => "controller.config.vel_gain",
            AxisParam::VelIntegratorGain(_) => "controller.config.vel_integrator_gain",
            AxisParam::PosGain(_) => "controller.config.pos_gain",
        }
    }

    /// Value as the ASCII protocol expects it
    pub fn wire_value(&self) -> String {
        match *self {
            AxisParam::CurrentLim(v)
            | AxisParam::VelLimit(v)
            | AxisParam::CalibrationCurrent(v)
            | AxisParam::EncoderBandwidth(v)
            | AxisParam::VelGain(v)
            | AxisParam::VelIntegratorGain(v)
            | AxisParam::PosGain(v) => v.to_string(),
            AxisParam::PolePairs(v) | AxisParam::EncoderCpr(v) => v.to_string(),
            AxisParam::MotorType(t) => (t as u8).to_string(),
            AxisParam::MotorPreCalibrated(b)
            | AxisParam::EncoderUseIndex(b)
            | AxisParam::EncoderZeroCountOnFindIdx(b)
            | AxisParam::EncoderPreCalibrated(b)
            | AxisParam::StartupEncoderIndexSearch(b)
            | AxisParam::StartupEncoderOffsetCalibration(b)
            | AxisParam::StartupClosedLoopControl(b) => u8::from(b).to_string(),
        }
    }
}

/// Operations the axis controller needs from a dual-axis ODrive
///
/// Requests are fire-and-forget on the device side; state changes are
/// confirmed only by polling `current_state`.
pub trait OdriveDevice {
    fn board_info(&mut self) -> Result<BoardInfo>;

    fn vbus_voltage(&mut self) -> Result<f32>;

    fn encoder_cpr(&mut self, axis: AxisId) -> Result<u32>;

    fn request_state(&mut self, axis: AxisId, state: AxisState) -> Result<()>;

    /// `None` when the firmware reports a state outside [`AxisState`]
    fn current_state(&mut self, axis: AxisId) -> Result<Option<AxisState>>;

    fn set_control_mode(&mut self, axis: AxisId, mode: ControlMode) -> Result<()>;

    fn set_vel_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()>;

    fn set_pos_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()>;

    fn pos_setpoint(&mut self, axis: AxisId) -> Result<f32>;

    fn errors(&mut self, axis: AxisId) -> Result<AxisErrors>;

    /// Zero the axis, motor, encoder and controller error fields
    fn clear_errors(&mut self, axis: AxisId) -> Result<()>;

    fn motor_pre_calibrated(&mut self, axis: AxisId) -> Result<bool>;

    fn configure(&mut self, axis: AxisId, param: AxisParam) -> Result<()>;

    fn set_brake_resistance(&mut self, ohms: f32) -> Result<()>;

    fn save_configuration(&mut self) -> Result<()>;

    /// Reboot the board; the link is expected to drop
    fn reboot(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_state_decoding() {
        assert_eq!(AxisState::from_raw(1), Some(AxisState::Idle));
        assert_eq!(AxisState::from_raw(8), Some(AxisState::ClosedLoopControl));
        // startup sequence and motor calibration are firmware-internal
        assert_eq!(AxisState::from_raw(2), None);
        assert_eq!(AxisState::from_raw(4), None);
    }

    #[test]
    fn test_axis_id_other() {
        assert_eq!(AxisId::Axis0.other(), AxisId::Axis1);
        assert_eq!(AxisId::from_index(1), Some(AxisId::Axis1));
        assert_eq!(AxisId::from_index(2), None);
        assert_eq!(AxisId::Axis1.to_string(), "axis1");
    }

    #[test]
    fn test_param_wire_values() {
        assert_eq!(AxisParam::EncoderUseIndex(true).wire_value(), "1");
        assert_eq!(AxisParam::MotorType(MotorType::HighCurrent).wire_value(), "0");
        assert_eq!(AxisParam::PolePairs(4).wire_value(), "4");
        assert_eq!(AxisParam::VelGain(0.0003).wire_value(), "0.0003");
        assert_eq!(AxisParam::EncoderCpr(4000).path(), "encoder.config.cpr");
    }
}
