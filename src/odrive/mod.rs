// ODrive dual-axis motor controller support
//
// Provides:
// - ASCII serial protocol implementation and device discovery
// - Axis pair controller (calibrate / preroll / engage / drive)
// - One-time board provisioning
// - Differential-drive kinematics
// - Simulated board for tests and dry runs

pub mod ascii;
pub mod controller;
pub mod device;
pub mod discovery;
mod error;
pub mod kinematics;
pub mod provision;
pub mod sim;

pub use ascii::{AsciiBus, Port};
pub use controller::{AxisMap, AxisPairController, ConnectOptions, PairErrors, WaitPolicy};
pub use device::{AxisErrors, AxisId, AxisState, ControlMode, OdriveDevice};
pub use discovery::{DeviceFinder, DiscoveryQuery, SerialFinder};
pub use error::{OdriveError, Result};
pub use kinematics::{DriveGeometry, WheelVelocities, twist_to_wheels};
pub use provision::ProvisionConfig;
pub use sim::{SimFinder, SimulatedOdrive};
