// Simulated dual-axis ODrive
//
// Models the firmware behaviour the controller depends on: calibration and
// index search run for a number of state polls before the axis returns to
// idle, closed-loop and idle requests take effect at once, and faults are
// latched into the error fields. Clones share state so a test can keep a
// handle while the controller owns another.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::device::{
    AxisErrors, AxisId, AxisParam, AxisState, BoardInfo, ControlMode, OdriveDevice,
};
use super::discovery::{DeviceFinder, DiscoveryQuery};
use super::error::{OdriveError, Result};

/// State polls a calibration or index search takes by default
pub const DEFAULT_TRANSITION_POLLS: u32 = 3;

#[derive(Debug, Clone)]
struct SimAxis {
    state: AxisState,
    polls_remaining: u32,
    pending_fault: Option<AxisErrors>,
    calibration_fault: Option<AxisErrors>,
    index_search_fault: Option<AxisErrors>,
    control_mode: ControlMode,
    vel_setpoint: f32,
    pos_setpoint: f32,
    errors: AxisErrors,
    encoder_cpr: u32,
    motor_pre_calibrated: bool,
    params: Vec<AxisParam>,
}

impl Default for SimAxis {
    fn default() -> Self {
        Self {
            state: AxisState::Idle,
            polls_remaining: 0,
            pending_fault: None,
            calibration_fault: None,
            index_search_fault: None,
            control_mode: ControlMode::VelocityControl,
            vel_setpoint: 0.0,
            pos_setpoint: 0.0,
            errors: AxisErrors::default(),
            encoder_cpr: 8192,
            motor_pre_calibrated: false,
            params: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    axes: [SimAxis; 2],
    board: BoardInfo,
    vbus_voltage: f32,
    brake_resistance: f32,
    transition_polls: u32,
    fail_release: bool,
    requests: Vec<(AxisId, AxisState)>,
    saves: u32,
    reboots: u32,
}

/// Cloneable handle to one simulated board
#[derive(Debug, Clone)]
pub struct SimulatedOdrive {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedOdrive {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                axes: [SimAxis::default(), SimAxis::default()],
                board: BoardInfo {
                    hw_version_major: 3,
                    hw_version_minor: 5,
                    hw_version_variant: 24,
                    fw_version_major: 0,
                    fw_version_minor: 4,
                    fw_version_revision: 12,
                    fw_version_unreleased: false,
                    serial_number: 0x2087_3592_524B,
                },
                vbus_voltage: 24.0,
                brake_resistance: 0.47,
                transition_polls: DEFAULT_TRANSITION_POLLS,
                fail_release: false,
                requests: Vec::new(),
                saves: 0,
                reboots: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn axis(&self, axis: AxisId) -> SimAxis {
        self.state().axes[axis.index() as usize].clone()
    }

    // === Scenario setup ===

    /// Number of state polls calibration and index search take
    pub fn set_transition_polls(&self, polls: u32) {
        self.state().transition_polls = polls;
    }

    pub fn set_encoder_cpr(&self, axis: AxisId, cpr: u32) {
        self.state().axes[axis.index() as usize].encoder_cpr = cpr;
    }

    /// Latch `errors` when the next full calibration on `axis` finishes
    pub fn fail_calibration(&self, axis: AxisId, errors: AxisErrors) {
        self.state().axes[axis.index() as usize].calibration_fault = Some(errors);
    }

    /// Latch `errors` when the next index search on `axis` finishes
    pub fn fail_index_search(&self, axis: AxisId, errors: AxisErrors) {
        self.state().axes[axis.index() as usize].index_search_fault = Some(errors);
    }

    /// Raise a fault right now; the firmware drops the axis to idle
    pub fn inject_fault(&self, axis: AxisId, errors: AxisErrors) {
        let mut state = self.state();
        let sim = &mut state.axes[axis.index() as usize];
        sim.errors = errors;
        sim.state = AxisState::Idle;
        sim.polls_remaining = 0;
    }

    /// Make idle requests fail as if the link had dropped
    pub fn set_fail_release(&self, fail: bool) {
        self.state().fail_release = fail;
    }

    // === Inspection ===

    /// Every accepted state request, in order
    pub fn requests(&self) -> Vec<(AxisId, AxisState)> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    pub fn state_of(&self, axis: AxisId) -> AxisState {
        self.axis(axis).state
    }

    pub fn vel_setpoint_of(&self, axis: AxisId) -> f32 {
        self.axis(axis).vel_setpoint
    }

    pub fn pos_setpoint_of(&self, axis: AxisId) -> f32 {
        self.axis(axis).pos_setpoint
    }

    pub fn control_mode_of(&self, axis: AxisId) -> ControlMode {
        self.axis(axis).control_mode
    }

    pub fn errors_of(&self, axis: AxisId) -> AxisErrors {
        self.axis(axis).errors
    }

    pub fn params_of(&self, axis: AxisId) -> Vec<AxisParam> {
        self.axis(axis).params
    }

    pub fn brake_resistance(&self) -> f32 {
        self.state().brake_resistance
    }

    pub fn saves(&self) -> u32 {
        self.state().saves
    }

    pub fn reboots(&self) -> u32 {
        self.state().reboots
    }
}

impl Default for SimulatedOdrive {
    fn default() -> Self {
        Self::new()
    }
}

impl OdriveDevice for SimulatedOdrive {
    fn board_info(&mut self) -> Result<BoardInfo> {
        Ok(self.state().board.clone())
    }

    fn vbus_voltage(&mut self) -> Result<f32> {
        Ok(self.state().vbus_voltage)
    }

    fn encoder_cpr(&mut self, axis: AxisId) -> Result<u32> {
        Ok(self.axis(axis).encoder_cpr)
    }

    fn request_state(&mut self, axis: AxisId, requested: AxisState) -> Result<()> {
        let mut state = self.state();
        if requested == AxisState::Idle && state.fail_release {
            return Err(OdriveError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link failure",
            )));
        }

        let polls = state.transition_polls;
        state.requests.push((axis, requested));
        let sim = &mut state.axes[axis.index() as usize];

        match requested {
            AxisState::Idle | AxisState::ClosedLoopControl => {
                sim.state = requested;
                sim.polls_remaining = 0;
                sim.pending_fault = None;
            }
            AxisState::FullCalibrationSequence => {
                sim.state = requested;
                sim.polls_remaining = polls;
                sim.pending_fault = sim.calibration_fault.take();
            }
            AxisState::EncoderIndexSearch => {
                sim.state = requested;
                sim.polls_remaining = polls;
                sim.pending_fault = sim.index_search_fault.take();
            }
        }

        if sim.polls_remaining == 0 && requested != AxisState::ClosedLoopControl {
            finish_transition(sim);
        }
        Ok(())
    }

    fn current_state(&mut self, axis: AxisId) -> Result<Option<AxisState>> {
        let mut state = self.state();
        let sim = &mut state.axes[axis.index() as usize];

        if sim.polls_remaining > 0 {
            sim.polls_remaining -= 1;
            if sim.polls_remaining == 0 {
                finish_transition(sim);
            }
        }
        Ok(Some(sim.state))
    }

    fn set_control_mode(&mut self, axis: AxisId, mode: ControlMode) -> Result<()> {
        self.state().axes[axis.index() as usize].control_mode = mode;
        Ok(())
    }

    fn set_vel_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()> {
        self.state().axes[axis.index() as usize].vel_setpoint = value;
        Ok(())
    }

    fn set_pos_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()> {
        self.state().axes[axis.index() as usize].pos_setpoint = value;
        Ok(())
    }

    fn pos_setpoint(&mut self, axis: AxisId) -> Result<f32> {
        Ok(self.axis(axis).pos_setpoint)
    }

    fn errors(&mut self, axis: AxisId) -> Result<AxisErrors> {
        Ok(self.axis(axis).errors)
    }

    fn clear_errors(&mut self, axis: AxisId) -> Result<()> {
        self.state().axes[axis.index() as usize].errors = AxisErrors::default();
        Ok(())
    }

    fn motor_pre_calibrated(&mut self, axis: AxisId) -> Result<bool> {
        Ok(self.axis(axis).motor_pre_calibrated)
    }

    fn configure(&mut self, axis: AxisId, param: AxisParam) -> Result<()> {
        let mut state = self.state();
        let sim = &mut state.axes[axis.index() as usize];
        match param {
            AxisParam::EncoderCpr(cpr) => sim.encoder_cpr = cpr,
            AxisParam::MotorPreCalibrated(flag) => sim.motor_pre_calibrated = flag,
            _ => {}
        }
        sim.params.push(param);
        Ok(())
    }

    fn set_brake_resistance(&mut self, ohms: f32) -> Result<()> {
        self.state().brake_resistance = ohms;
        Ok(())
    }

    fn save_configuration(&mut self) -> Result<()> {
        self.state().saves += 1;
        Ok(())
    }

    fn reboot(&mut self) -> Result<()> {
        let mut state = self.state();
        state.reboots += 1;
        for sim in state.axes.iter_mut() {
            sim.state = AxisState::Idle;
            sim.polls_remaining = 0;
            sim.errors = AxisErrors::default();
        }
        Ok(())
    }
}

/// Arrival at idle after a timed transition
fn finish_transition(sim: &mut SimAxis) {
    let was_calibrating = sim.state == AxisState::FullCalibrationSequence;
    sim.state = AxisState::Idle;
    match sim.pending_fault.take() {
        Some(fault) => sim.errors = fault,
        None if was_calibrating => sim.motor_pre_calibrated = true,
        None => {}
    }
}

/// Hands out clones of one simulated board
#[derive(Debug, Clone)]
pub struct SimFinder {
    device: SimulatedOdrive,
    present: bool,
}

impl SimFinder {
    pub fn new(device: SimulatedOdrive) -> Self {
        Self {
            device,
            present: true,
        }
    }

    /// A finder whose board is unplugged
    pub fn absent() -> Self {
        Self {
            device: SimulatedOdrive::new(),
            present: false,
        }
    }
}

impl DeviceFinder for SimFinder {
    type Device = SimulatedOdrive;

    fn find(&mut self, query: &DiscoveryQuery) -> Result<SimulatedOdrive> {
        let serial_number = self.device.state().board.serial_number;
        if self.present && query.matches_serial(serial_number) {
            Ok(self.device.clone())
        } else {
            Err(OdriveError::NotFound {
                timeout: query.timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_takes_polls_then_idles() {
        let mut sim = SimulatedOdrive::new();
        sim.set_transition_polls(2);
        sim.request_state(AxisId::Axis0, AxisState::FullCalibrationSequence)
            .unwrap();

        assert_eq!(
            sim.current_state(AxisId::Axis0).unwrap(),
            Some(AxisState::FullCalibrationSequence)
        );
        assert_eq!(
            sim.current_state(AxisId::Axis0).unwrap(),
            Some(AxisState::Idle)
        );
        assert!(sim.motor_pre_calibrated(AxisId::Axis0).unwrap());
    }

    #[test]
    fn test_injected_calibration_fault_latches_on_idle() {
        let mut sim = SimulatedOdrive::new();
        sim.set_transition_polls(1);
        let fault = AxisErrors {
            axis: 0x100,
            motor: 0x2,
            ..AxisErrors::default()
        };
        sim.fail_calibration(AxisId::Axis1, fault);
        sim.request_state(AxisId::Axis1, AxisState::FullCalibrationSequence)
            .unwrap();

        assert!(sim.errors(AxisId::Axis1).unwrap().is_clear());
        sim.current_state(AxisId::Axis1).unwrap();
        assert_eq!(sim.errors(AxisId::Axis1).unwrap(), fault);
        assert!(!sim.motor_pre_calibrated(AxisId::Axis1).unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let sim = SimulatedOdrive::new();
        let mut handle = sim.clone();
        handle.set_vel_setpoint(AxisId::Axis1, 12.5).unwrap();
        assert_eq!(sim.vel_setpoint_of(AxisId::Axis1), 12.5);
    }

    #[test]
    fn test_failed_release_is_not_recorded() {
        let mut sim = SimulatedOdrive::new();
        sim.set_fail_release(true);
        assert!(sim.request_state(AxisId::Axis0, AxisState::Idle).is_err());
        assert!(sim.requests().is_empty());
    }

    #[test]
    fn test_finder_respects_serial_filter() {
        let mut finder = SimFinder::new(SimulatedOdrive::new());
        let mut query = DiscoveryQuery {
            port: None,
            timeout: std::time::Duration::from_secs(1),
            serial_number: Some("20873592524b".to_string()),
        };
        assert!(finder.find(&query).is_ok());

        query.serial_number = Some("DEADBEEF".to_string());
        assert!(matches!(
            finder.find(&query),
            Err(OdriveError::NotFound { .. })
        ));
    }
}
