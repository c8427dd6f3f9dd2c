// End-to-end controller scenarios against the simulated board

use odrive_zenoh_runtime::odrive::{
    AxisErrors, AxisId, AxisPairController, AxisState, ConnectOptions, OdriveError, SimFinder,
    SimulatedOdrive, WaitPolicy,
};

fn controller(sim: &SimulatedOdrive) -> AxisPairController<SimFinder> {
    AxisPairController::new(SimFinder::new(sim.clone())).with_wait_policy(WaitPolicy::immediate())
}

fn connect_with_right(ctrl: &mut AxisPairController<SimFinder>, right_axis: AxisId) {
    ctrl.connect(&ConnectOptions {
        right_axis,
        ..ConnectOptions::default()
    })
    .expect("simulated board is present");
}

#[test]
fn mapping_and_right_wheel_inversion_for_every_right_axis() {
    for right in AxisId::BOTH {
        let sim = SimulatedOdrive::new();
        let mut ctrl = controller(&sim);
        connect_with_right(&mut ctrl, right);

        assert_eq!(ctrl.right_axis(), Some(right));
        assert_eq!(ctrl.left_axis(), Some(right.other()));

        ctrl.drive(30.0, 70.0).unwrap();
        assert_eq!(sim.vel_setpoint_of(right), -70.0);
        assert_eq!(sim.vel_setpoint_of(right.other()), 30.0);
    }
}

#[test]
fn reconnect_rebinds_axes_and_rereads_encoder() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);
    assert_eq!(ctrl.right_axis(), Some(AxisId::Axis0));

    sim.set_encoder_cpr(AxisId::Axis0, 2048);
    connect_with_right(&mut ctrl, AxisId::Axis1);

    assert!(ctrl.is_connected());
    assert_eq!(ctrl.right_axis(), Some(AxisId::Axis1));
    assert_eq!(ctrl.left_axis(), Some(AxisId::Axis0));
    assert_eq!(ctrl.encoder_cpr(), 2048);

    ctrl.drive(10.0, 20.0).unwrap();
    assert_eq!(sim.vel_setpoint_of(AxisId::Axis0), 10.0);
    assert_eq!(sim.vel_setpoint_of(AxisId::Axis1), -20.0);
}

#[test]
fn disconnect_without_connect_fails_quietly() {
    let mut ctrl = controller(&SimulatedOdrive::new());
    assert!(matches!(ctrl.disconnect(), Err(OdriveError::NotConnected)));
    assert!(!ctrl.is_connected());
}

#[test]
fn disconnect_clears_session_even_when_release_fails() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);
    ctrl.preroll(true).unwrap();
    assert!(ctrl.prerolled_flag());

    sim.set_fail_release(true);
    assert!(ctrl.disconnect().is_err());

    assert!(!ctrl.is_connected());
    assert!(!ctrl.prerolled_flag());
    assert_eq!(ctrl.left_axis(), None);
    assert_eq!(ctrl.right_axis(), None);
}

#[test]
fn second_preroll_is_rejected_without_new_requests() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);

    ctrl.preroll(true).unwrap();
    assert!(ctrl.prerolled().unwrap());
    sim.clear_requests();

    assert!(matches!(
        ctrl.preroll(true),
        Err(OdriveError::AlreadyPrerolled)
    ));
    assert!(sim.requests().is_empty());
}

#[test]
fn calibration_stops_at_first_faulted_axis() {
    let sim = SimulatedOdrive::new();
    sim.fail_calibration(
        AxisId::Axis0,
        AxisErrors {
            axis: 0x100,
            motor: 0x10,
            ..AxisErrors::default()
        },
    );
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);

    assert!(matches!(
        ctrl.calibrate(),
        Err(OdriveError::AxisFault {
            axis: AxisId::Axis0,
            ..
        })
    ));
    assert_eq!(
        sim.requests(),
        vec![(AxisId::Axis0, AxisState::FullCalibrationSequence)]
    );
}

#[test]
fn calibration_runs_both_axes_in_order() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis1);

    ctrl.calibrate().unwrap();
    assert_eq!(
        sim.requests(),
        vec![
            (AxisId::Axis0, AxisState::FullCalibrationSequence),
            (AxisId::Axis1, AxisState::FullCalibrationSequence),
        ]
    );
    assert!(ctrl.idle().unwrap());
}

#[test]
fn cleared_errors_stay_cleared() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);

    sim.inject_fault(
        AxisId::Axis1,
        AxisErrors {
            axis: 0x1,
            motor: 0x2,
            encoder: 0x4,
            controller: 0x8,
        },
    );
    assert!(ctrl.get_errors(true).unwrap().is_some());

    assert_eq!(ctrl.get_errors(true).unwrap(), None);
    for axis in AxisId::BOTH {
        assert_eq!(sim.errors_of(axis), AxisErrors::default());
    }
}

#[test]
fn engage_then_drive_with_right_on_axis1() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis1);

    ctrl.engage().unwrap();
    ctrl.drive(100.0, 50.0).unwrap();

    assert_eq!(sim.vel_setpoint_of(AxisId::Axis0), 100.0);
    assert_eq!(sim.vel_setpoint_of(AxisId::Axis1), -50.0);
    assert!(ctrl.engaged().unwrap());
}

#[test]
fn provisioning_ends_the_session() {
    let sim = SimulatedOdrive::new();
    let mut ctrl = controller(&sim);
    connect_with_right(&mut ctrl, AxisId::Axis0);

    ctrl.provision(&Default::default()).unwrap();
    assert!(!ctrl.is_connected());
    assert_eq!(sim.reboots(), 1);

    // The board comes back with the provisioned encoder resolution
    connect_with_right(&mut ctrl, AxisId::Axis0);
    assert_eq!(ctrl.encoder_cpr(), 4000);
}
