// Timeouts, topics, controller defaults
use std::time::Duration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Axis error poll rate inside the runtime loop (once per second)
pub const ERROR_CHECK_TICKS: u64 = LOOP_HZ;

// Zenoh topics
pub const TOPIC_CMD_VEL: &str = "odrive/cmd/vel"; // twist commands
pub const TOPIC_RT_WHEELS: &str = "odrive/rt/wheels"; // wheel setpoints sent
pub const TOPIC_HEALTH: &str = "odrive/state/health"; // health status

// Device discovery
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

// Axis state polling
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const CALIBRATION_SETTLE: Duration = Duration::from_secs(1);

// Pause after requesting a reboot before the board is usable again
pub const REBOOT_SETTLE: Duration = Duration::from_millis(250);

// Encoder resolution assumed until one is read from the board
pub const DEFAULT_ENCODER_CPR: u32 = 4096;
