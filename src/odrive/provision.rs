// One-time board provisioning
//
// Writes motor, encoder and controller configuration to both axes,
// calibrates motors that have never been calibrated, enables the startup
// sequence, persists everything to flash and reboots the board.
// Not part of normal operation: run once per board, then reconnect.

use std::thread::sleep;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::controller::{WaitPolicy, wait_for_idle};
use super::device::{AxisId, AxisParam, AxisState, MotorType, OdriveDevice};
use super::error::{OdriveError, Result};
use crate::config::REBOOT_SETTLE;

/// Values written during provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub brake_resistance: f32,
    pub current_lim: f32,
    pub pole_pairs: u32,
    /// counts/s
    pub vel_limit: f32,
    pub motor_type: MotorType,
    pub encoder_cpr: u32,
    pub encoder_bandwidth: f32,
    pub use_index: bool,
    pub zero_count_on_find_idx: bool,
    pub encoder_pre_calibrated: bool,
    pub calibration_current: f32,
    pub vel_gain: f32,
    pub vel_integrator_gain: f32,
    pub pos_gain: f32,
    pub startup_encoder_index_search: bool,
    pub startup_encoder_offset_calibration: bool,
    pub startup_closed_loop_control: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            brake_resistance: 0.0,
            current_lim: 3.0,
            pole_pairs: 4,
            vel_limit: 600_000.0,
            motor_type: MotorType::HighCurrent,
            encoder_cpr: 4000,
            encoder_bandwidth: 1000.0,
            use_index: true,
            zero_count_on_find_idx: true,
            encoder_pre_calibrated: false,
            calibration_current: 5.0,
            vel_gain: 0.0003,
            vel_integrator_gain: 0.0,
            pos_gain: 2.0,
            startup_encoder_index_search: true,
            startup_encoder_offset_calibration: true,
            startup_closed_loop_control: true,
        }
    }
}

impl ProvisionConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Motor and encoder parameters, written before calibration
    pub fn hardware_params(&self) -> [AxisParam; 10] {
        [
            AxisParam::CurrentLim(self.current_lim),
            AxisParam::PolePairs(self.pole_pairs),
            AxisParam::VelLimit(self.vel_limit),
            AxisParam::MotorType(self.motor_type),
            AxisParam::EncoderCpr(self.encoder_cpr),
            AxisParam::EncoderBandwidth(self.encoder_bandwidth),
            AxisParam::EncoderUseIndex(self.use_index),
            AxisParam::EncoderZeroCountOnFindIdx(self.zero_count_on_find_idx),
            AxisParam::EncoderPreCalibrated(self.encoder_pre_calibrated),
            AxisParam::CalibrationCurrent(self.calibration_current),
        ]
    }

    /// Startup behaviour and gains, written after calibration
    pub fn startup_params(&self) -> [AxisParam; 7] {
        [
            AxisParam::MotorPreCalibrated(true),
            AxisParam::StartupEncoderIndexSearch(self.startup_encoder_index_search),
            AxisParam::StartupEncoderOffsetCalibration(self.startup_encoder_offset_calibration),
            AxisParam::VelGain(self.vel_gain),
            AxisParam::VelIntegratorGain(self.vel_integrator_gain),
            AxisParam::PosGain(self.pos_gain),
            AxisParam::StartupClosedLoopControl(self.startup_closed_loop_control),
        ]
    }
}

/// Run the provisioning sequence; the board reboots at the end
pub fn apply<D: OdriveDevice>(
    device: &mut D,
    config: &ProvisionConfig,
    wait: &WaitPolicy,
) -> Result<()> {
    device.set_brake_resistance(config.brake_resistance)?;

    for axis in AxisId::BOTH {
        info!("Configuring {}", axis);
        device.request_state(axis, AxisState::Idle)?;
        for param in config.hardware_params() {
            device.configure(axis, param)?;
        }

        if !device.motor_pre_calibrated(axis)? {
            info!("{} motor not calibrated yet, running full calibration", axis);
            device.request_state(axis, AxisState::FullCalibrationSequence)?;
            sleep(wait.settle);
            wait_for_idle(device, axis, wait)?;

            let errors = device.errors(axis)?;
            if errors.axis != 0 || errors.motor != 0 {
                return Err(OdriveError::AxisFault { axis, errors });
            }
        }
    }
    info!("Setup done.");

    for axis in AxisId::BOTH {
        device.request_state(axis, AxisState::Idle)?;
        for param in config.startup_params() {
            device.configure(axis, param)?;
        }
        device.set_pos_setpoint(axis, 0.0)?;
        device.set_vel_setpoint(axis, 0.0)?;
    }

    device.save_configuration()?;
    info!("Configuration saved, rebooting.");
    device.reboot()?;
    sleep(REBOOT_SETTLE);
    Ok(())
}
