// Define message types for the runtime

use serde::{Deserialize, Serialize};

use crate::odrive::WheelVelocities;

// Command from teleop/scripts -> runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwistCommand {
    pub linear: f32,  // m/s, positive = forward
    pub angular: f32, // rad/s, positive = counter-clockwise
}

// Wheel setpoints the runtime sent to the controller, in counts/s
// Has default values because we don't always have an actuation to send
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct WheelActuation {
    pub left: f32,
    pub right: f32,
}

impl From<WheelVelocities> for WheelActuation {
    fn from(wheels: WheelVelocities) -> Self {
        Self {
            left: wheels.left,
            right: wheels.right,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    AxisFault,
    LinkError,
}
