// Host-side orchestration of a dual-axis ODrive on a differential-drive base
//
// The firmware owns each axis state machine; this controller only requests
// states and, on blocking paths, polls until the axis reports arrival.
//
//   connect -> calibrate -> preroll -> engage / drive -> release -> disconnect

use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{Level, Span, debug, error, info, info_span, warn};

use super::device::{AxisErrors, AxisId, AxisState, ControlMode, OdriveDevice};
use super::discovery::{DeviceFinder, DiscoveryQuery};
use super::error::{OdriveError, Result};
use super::provision::{self, ProvisionConfig};
use crate::config::{
    CALIBRATION_SETTLE, DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_ENCODER_CPR, POLL_INTERVAL,
};

/// Which physical axis drives which wheel, fixed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisMap {
    pub left: AxisId,
    pub right: AxisId,
}

impl AxisMap {
    pub fn with_right(right: AxisId) -> Self {
        Self {
            left: right.other(),
            right,
        }
    }
}

/// Parameters for `connect`
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: Option<String>,
    pub right_axis: AxisId,
    pub timeout: Duration,
    pub serial_number: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: None,
            right_axis: AxisId::Axis0,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            serial_number: None,
        }
    }
}

impl ConnectOptions {
    fn query(&self) -> DiscoveryQuery {
        DiscoveryQuery {
            port: self.port.clone(),
            timeout: self.timeout,
            serial_number: self.serial_number.clone(),
        }
    }
}

/// How blocking operations wait for an axis to reach idle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    /// Sleep between state polls
    pub interval: Duration,
    /// Pause after requesting calibration before the first poll
    pub settle: Duration,
    /// Give up after this long; `None` waits for as long as the firmware takes
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            settle: CALIBRATION_SETTLE,
            timeout: None,
        }
    }
}

impl WaitPolicy {
    /// No sleeping at all; for simulated devices
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            settle: Duration::ZERO,
            timeout: None,
        }
    }
}

/// Error snapshot of both axes, returned when either axis reported an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairErrors {
    pub axis0: AxisErrors,
    pub axis1: AxisErrors,
}

impl PairErrors {
    pub fn get(&self, axis: AxisId) -> AxisErrors {
        match axis {
            AxisId::Axis0 => self.axis0,
            AxisId::Axis1 => self.axis1,
        }
    }
}

impl fmt::Display for PairErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error (axis0: {}; axis1: {})", self.axis0, self.axis1)
    }
}

/// Poll `axis` until it reports idle
pub fn wait_for_idle<D: OdriveDevice>(
    device: &mut D,
    axis: AxisId,
    policy: &WaitPolicy,
) -> Result<()> {
    let started = Instant::now();
    loop {
        if device.current_state(axis)? == Some(AxisState::Idle) {
            return Ok(());
        }

        if let Some(limit) = policy.timeout {
            let waited = started.elapsed();
            if waited >= limit {
                return Err(OdriveError::Timeout { axis, waited });
            }
        }
        sleep(policy.interval);
    }
}

fn release_axes<D: OdriveDevice>(device: &mut D) -> Result<()> {
    debug!("Releasing.");
    for axis in AxisId::BOTH {
        device.request_state(axis, AxisState::Idle)?;
    }
    Ok(())
}

fn collect_errors<D: OdriveDevice>(device: &mut D, clear: bool) -> Result<Option<PairErrors>> {
    let errors = PairErrors {
        axis0: device.errors(AxisId::Axis0)?,
        axis1: device.errors(AxisId::Axis1)?,
    };
    let any = errors.axis0.axis != 0 || errors.axis1.axis != 0;

    if clear {
        for axis in AxisId::BOTH {
            device.clear_errors(axis)?;
        }
    }
    Ok(any.then_some(errors))
}

/// Log a failed operation; every failure leaves the controller through here
fn report<T>(operation: &str, result: Result<T>) -> Result<T> {
    match &result {
        Err(OdriveError::AlreadyPrerolled) => debug!("{}: already prerolled", operation),
        Err(e) => error!("{} failed: {}", operation, e),
        Ok(_) => {}
    }
    result
}

struct Session<D> {
    device: D,
    axes: AxisMap,
}

fn connected<D>(session: &mut Option<Session<D>>) -> Result<&mut Session<D>> {
    session.as_mut().ok_or(OdriveError::NotConnected)
}

/// Owns the connection to one dual-axis board and sequences its axes
pub struct AxisPairController<F: DeviceFinder> {
    finder: F,
    session: Option<Session<F::Device>>,
    prerolled: bool,
    encoder_cpr: u32,
    wait: WaitPolicy,
    span: Span,
}

impl<F: DeviceFinder> AxisPairController<F> {
    pub fn new(finder: F) -> Self {
        Self {
            finder,
            session: None,
            prerolled: false,
            encoder_cpr: DEFAULT_ENCODER_CPR,
            wait: WaitPolicy::default(),
            span: info_span!("odrive"),
        }
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Emit all controller events inside `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn axes(&self) -> Option<AxisMap> {
        self.session.as_ref().map(|s| s.axes)
    }

    pub fn left_axis(&self) -> Option<AxisId> {
        self.axes().map(|a| a.left)
    }

    pub fn right_axis(&self) -> Option<AxisId> {
        self.axes().map(|a| a.right)
    }

    /// Encoder counts per revolution, as read at the last connect
    pub fn encoder_cpr(&self) -> u32 {
        self.encoder_cpr
    }

    /// Session flag only; see [`Self::prerolled`] for the checked query
    pub fn prerolled_flag(&self) -> bool {
        self.prerolled
    }

    /// Discover a board and bind the left/right axes
    ///
    /// An existing session is replaced without releasing its axes first.
    pub fn connect(&mut self, options: &ConnectOptions) -> Result<()> {
        let _entered = self.span.clone().entered();

        if self.session.is_some() {
            info!("Already connected. Reconnecting.");
        }

        let mut device = match self.finder.find(&options.query()) {
            Ok(device) => device,
            Err(e) => {
                error!("No ODrive found. Is device powered?");
                return Err(e);
            }
        };

        let result = device
            .encoder_cpr(AxisId::Axis0)
            .and_then(|cpr| Ok((cpr, device.board_info()?)));
        let (encoder_cpr, board) = report("connect", result)?;

        let axes = AxisMap::with_right(options.right_axis);
        self.encoder_cpr = encoder_cpr;
        self.session = Some(Session { device, axes });

        info!(
            "Connected to ODrive. {} (left={}, right={}, cpr={})",
            board, axes.left, axes.right, encoder_cpr
        );
        Ok(())
    }

    /// Reset the session, idle both axes and drop the device handle
    pub fn disconnect(&mut self) -> Result<()> {
        let _entered = self.span.clone().entered();

        self.prerolled = false;
        let Some(mut session) = self.session.take() else {
            error!("Not connected.");
            return Err(OdriveError::NotConnected);
        };

        let result = release_axes(&mut session.device);
        drop(session);
        report("disconnect", result)
    }

    /// Run the full calibration sequence on axis 0, then axis 1
    ///
    /// Blocks until both axes are back to idle; stops at the first faulted axis.
    pub fn calibrate(&mut self) -> Result<()> {
        let _entered = self.span.clone().entered();
        let wait = self.wait;

        let result = connected(&mut self.session).and_then(|session| {
            let device = &mut session.device;
            info!("Vbus {:.2}V", device.vbus_voltage()?);

            for axis in AxisId::BOTH {
                info!("Calibrating {}...", axis);
                device.request_state(axis, AxisState::FullCalibrationSequence)?;
                sleep(wait.settle);
                wait_for_idle(device, axis, &wait)?;

                let errors = device.errors(axis)?;
                if errors.axis != 0 || errors.motor != 0 {
                    return Err(OdriveError::AxisFault { axis, errors });
                }
            }
            Ok(())
        });
        report("calibrate", result)
    }

    /// Start encoder index search on both axes
    ///
    /// With `wait`, blocks until both axes are idle and checks their errors.
    /// Without it, the session is marked prerolled immediately.
    pub fn preroll(&mut self, wait: bool) -> Result<()> {
        let _entered = self.span.clone().entered();
        let policy = self.wait;
        let already = self.prerolled;

        let result = connected(&mut self.session).and_then(|session| {
            if already {
                return Err(OdriveError::AlreadyPrerolled);
            }
            let device = &mut session.device;

            for axis in AxisId::BOTH {
                info!("Index search preroll {}...", axis);
                device.request_state(axis, AxisState::EncoderIndexSearch)?;
            }

            if wait {
                for axis in AxisId::BOTH {
                    wait_for_idle(device, axis, &policy)?;
                }
                for axis in AxisId::BOTH {
                    let errors = device.errors(axis)?;
                    if errors.axis != 0 {
                        return Err(OdriveError::AxisFault { axis, errors });
                    }
                }
            }
            Ok(())
        });

        let result = report("preroll", result);
        if result.is_ok() {
            self.prerolled = true;
        }
        result
    }

    fn states(&mut self) -> Result<[Option<AxisState>; 2]> {
        let session = connected(&mut self.session)?;
        Ok([
            session.device.current_state(AxisId::Axis0)?,
            session.device.current_state(AxisId::Axis1)?,
        ])
    }

    /// Either axis is searching for its encoder index
    pub fn prerolling(&mut self) -> Result<bool> {
        Ok(self
            .states()?
            .contains(&Some(AxisState::EncoderIndexSearch)))
    }

    /// Prerolled this session and not searching again
    pub fn prerolled(&mut self) -> Result<bool> {
        let searching = self.prerolling()?;
        Ok(self.prerolled && !searching)
    }

    /// Either axis is in closed-loop control
    pub fn engaged(&mut self) -> Result<bool> {
        Ok(self.states()?.contains(&Some(AxisState::ClosedLoopControl)))
    }

    /// Both axes are idle
    pub fn idle(&mut self) -> Result<bool> {
        Ok(self
            .states()?
            .iter()
            .all(|s| *s == Some(AxisState::Idle)))
    }

    /// Zero velocity and request closed-loop velocity control; does not wait
    pub fn engage(&mut self) -> Result<()> {
        let _entered = self.span.clone().entered();

        let result = connected(&mut self.session).and_then(|session| {
            let device = &mut session.device;
            for axis in AxisId::BOTH {
                device.set_vel_setpoint(axis, 0.0)?;
                device.set_control_mode(axis, ControlMode::VelocityControl)?;
                device.request_state(axis, AxisState::ClosedLoopControl)?;
            }
            debug!("Engaged.");
            Ok(())
        });
        report("engage", result)
    }

    /// Request idle on both axes; does not wait
    pub fn release(&mut self) -> Result<()> {
        let _entered = self.span.clone().entered();
        let result = connected(&mut self.session).and_then(|s| release_axes(&mut s.device));
        report("release", result)
    }

    /// Velocity command; the right wheel is mounted mirrored so its sign is flipped
    pub fn drive(&mut self, left: f32, right: f32) -> Result<()> {
        let _entered = self.span.clone().entered();

        let result = connected(&mut self.session).and_then(|session| {
            let device = &mut session.device;
            for axis in AxisId::BOTH {
                device.request_state(axis, AxisState::ClosedLoopControl)?;
                device.set_control_mode(axis, ControlMode::VelocityControl)?;
            }
            device.set_vel_setpoint(session.axes.left, left)?;
            device.set_vel_setpoint(session.axes.right, -right)?;
            Ok(())
        });
        report("drive", result)
    }

    /// Position command; setpoints are passed through without sign changes
    pub fn drive_pos(&mut self, left: f32, right: f32) -> Result<()> {
        let _entered = self.span.clone().entered();

        let result = connected(&mut self.session).and_then(|session| {
            let axes = session.axes;
            let device = &mut session.device;
            for axis in AxisId::BOTH {
                device.set_control_mode(axis, ControlMode::PositionControl)?;
                device.request_state(axis, AxisState::ClosedLoopControl)?;
            }

            if tracing::enabled!(Level::DEBUG) {
                debug!(
                    "Position setpoints were left={}, right={}",
                    device.pos_setpoint(axes.left)?,
                    device.pos_setpoint(axes.right)?
                );
            }
            device.set_pos_setpoint(axes.left, left)?;
            device.set_pos_setpoint(axes.right, right)?;
            debug!("Position setpoints now left={}, right={}", left, right);
            Ok(())
        });
        report("drive_pos", result)
    }

    /// Collect axis errors, optionally clearing every error field on both axes
    ///
    /// `Ok(None)` when disconnected or when neither axis reports a top-level error.
    pub fn get_errors(&mut self, clear: bool) -> Result<Option<PairErrors>> {
        let _entered = self.span.clone().entered();
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        report("get_errors", collect_errors(&mut session.device, clear))
    }

    /// One-time board setup persisted to flash, followed by a reboot
    ///
    /// Ends the session: connect again once the board is back.
    pub fn provision(&mut self, config: &ProvisionConfig) -> Result<()> {
        let _entered = self.span.clone().entered();
        let wait = self.wait;

        let result = connected(&mut self.session)
            .and_then(|session| provision::apply(&mut session.device, config, &wait));
        let result = report("provision", result);

        if result.is_ok() {
            self.session = None;
            self.prerolled = false;
            info!("Provisioning saved and board rebooted. Reconnect before use.");
        }
        result
    }
}

impl<F: DeviceFinder> Drop for AxisPairController<F> {
    fn drop(&mut self) {
        // Leave the motors unpowered when the controller goes away
        if self.session.is_some() {
            if let Err(e) = self.disconnect() {
                warn!("Failed to release axes on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odrive::sim::{SimFinder, SimulatedOdrive};

    fn controller(sim: &SimulatedOdrive) -> AxisPairController<SimFinder> {
        AxisPairController::new(SimFinder::new(sim.clone())).with_wait_policy(WaitPolicy::immediate())
    }

    fn options(right_axis: AxisId) -> ConnectOptions {
        ConnectOptions {
            right_axis,
            ..ConnectOptions::default()
        }
    }

    #[test]
    fn test_axis_map_is_complementary() {
        for right in AxisId::BOTH {
            let map = AxisMap::with_right(right);
            assert_eq!(map.right, right);
            assert_eq!(map.left, right.other());
        }
    }

    #[test]
    fn test_connect_reads_encoder_cpr() {
        let sim = SimulatedOdrive::new();
        sim.set_encoder_cpr(AxisId::Axis0, 4000);
        let mut ctrl = controller(&sim);

        assert_eq!(ctrl.encoder_cpr(), DEFAULT_ENCODER_CPR);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();
        assert!(ctrl.is_connected());
        assert_eq!(ctrl.encoder_cpr(), 4000);
    }

    #[test]
    fn test_connect_failure_keeps_existing_session() {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis1)).unwrap();

        let mut absent = AxisPairController::new(SimFinder::absent());
        assert!(matches!(
            absent.connect(&ConnectOptions::default()),
            Err(OdriveError::NotFound { .. })
        ));
        assert!(!absent.is_connected());
        assert_eq!(absent.left_axis(), None);

        // A filter that matches nothing leaves the bound session alone
        let filtered = ConnectOptions {
            serial_number: Some("0".to_string()),
            ..options(AxisId::Axis0)
        };
        assert!(ctrl.connect(&filtered).is_err());
        assert_eq!(ctrl.right_axis(), Some(AxisId::Axis1));
    }

    /// Log sink shared between the subscriber and the test
    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_events_carry_the_injected_span() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let sim = SimulatedOdrive::new();
            let mut ctrl = controller(&sim).with_span(info_span!("left_base"));
            ctrl.connect(&options(AxisId::Axis0)).unwrap();
            assert!(ctrl.is_connected());
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("Connected to ODrive"))
            .expect("connect is logged");
        assert!(line.contains("left_base"));
    }

    #[test]
    fn test_operations_require_connection() {
        let mut ctrl = AxisPairController::new(SimFinder::absent());
        assert!(matches!(ctrl.calibrate(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.preroll(true), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.engage(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.release(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.drive(1.0, 1.0), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.drive_pos(1.0, 1.0), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.idle(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.engaged(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.prerolling(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.prerolled(), Err(OdriveError::NotConnected)));
        assert!(matches!(ctrl.get_errors(true), Ok(None)));
    }

    #[test]
    fn test_engage_zeroes_and_requests_closed_loop() {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();
        ctrl.drive(10.0, 10.0).unwrap();

        ctrl.engage().unwrap();
        for axis in AxisId::BOTH {
            assert_eq!(sim.vel_setpoint_of(axis), 0.0);
            assert_eq!(sim.control_mode_of(axis), ControlMode::VelocityControl);
            assert_eq!(sim.state_of(axis), AxisState::ClosedLoopControl);
        }
        assert!(ctrl.engaged().unwrap());

        ctrl.release().unwrap();
        assert!(ctrl.idle().unwrap());
        assert!(!ctrl.engaged().unwrap());
    }

    #[test]
    fn test_drive_pos_does_not_invert() {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        ctrl.drive_pos(1000.0, 2000.0).unwrap();
        assert_eq!(sim.pos_setpoint_of(AxisId::Axis1), 1000.0);
        assert_eq!(sim.pos_setpoint_of(AxisId::Axis0), 2000.0);
        assert_eq!(
            sim.control_mode_of(AxisId::Axis0),
            ControlMode::PositionControl
        );
    }

    #[test]
    fn test_preroll_without_wait_marks_immediately() {
        let sim = SimulatedOdrive::new();
        sim.set_transition_polls(5);
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        ctrl.preroll(false).unwrap();
        assert!(ctrl.prerolled_flag());
        // Still searching, so the checked query says no
        assert!(ctrl.prerolling().unwrap());
        assert!(!ctrl.prerolled().unwrap());
    }

    #[test]
    fn test_preroll_fault_leaves_flag_clear() {
        let sim = SimulatedOdrive::new();
        let fault = AxisErrors {
            axis: 0x40,
            ..AxisErrors::default()
        };
        sim.fail_index_search(AxisId::Axis1, fault);
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        match ctrl.preroll(true) {
            Err(OdriveError::AxisFault { axis, errors }) => {
                assert_eq!(axis, AxisId::Axis1);
                assert_eq!(errors, fault);
            }
            other => panic!("expected axis fault, got {:?}", other),
        }
        assert!(!ctrl.prerolled_flag());
        // Both requests went out before any wait
        assert_eq!(
            sim.requests(),
            vec![
                (AxisId::Axis0, AxisState::EncoderIndexSearch),
                (AxisId::Axis1, AxisState::EncoderIndexSearch),
            ]
        );
    }

    #[test]
    fn test_wait_timeout() {
        let sim = SimulatedOdrive::new();
        sim.set_transition_polls(u32::MAX);
        let mut ctrl = controller(&sim).with_wait_policy(WaitPolicy {
            interval: Duration::from_millis(1),
            settle: Duration::ZERO,
            timeout: Some(Duration::from_millis(20)),
        });
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        assert!(matches!(
            ctrl.calibrate(),
            Err(OdriveError::Timeout {
                axis: AxisId::Axis0,
                ..
            })
        ));
    }

    #[test]
    fn test_get_errors_without_clear_keeps_codes() {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        let fault = AxisErrors {
            axis: 0x200,
            encoder: 0x4,
            ..AxisErrors::default()
        };
        sim.inject_fault(AxisId::Axis0, fault);

        let first = ctrl.get_errors(false).unwrap().expect("fault reported");
        assert_eq!(first.get(AxisId::Axis0), fault);
        assert!(first.to_string().starts_with("error"));
        assert!(ctrl.get_errors(false).unwrap().is_some());
    }

    #[test]
    fn test_sub_unit_error_alone_is_not_reported() {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        ctrl.connect(&options(AxisId::Axis0)).unwrap();

        sim.inject_fault(
            AxisId::Axis1,
            AxisErrors {
                controller: 0x1,
                ..AxisErrors::default()
            },
        );
        assert_eq!(ctrl.get_errors(true).unwrap(), None);
        assert!(sim.errors_of(AxisId::Axis1).is_clear());
    }

    #[test]
    fn test_drop_releases_axes() {
        let sim = SimulatedOdrive::new();
        {
            let mut ctrl = controller(&sim);
            ctrl.connect(&options(AxisId::Axis0)).unwrap();
            ctrl.engage().unwrap();
        }
        assert_eq!(sim.state_of(AxisId::Axis0), AxisState::Idle);
        assert_eq!(sim.state_of(AxisId::Axis1), AxisState::Idle);
    }
}
