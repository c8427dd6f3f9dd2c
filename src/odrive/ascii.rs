// ODrive ASCII protocol over a serial link
//
// Every command is one line terminated by '\n':
//   r <property>            -> one reply line with the value
//   w <property> <value>    -> no reply
//   ss / sr                 -> save configuration / reboot, no reply
// Reads carry an optional "*<xor>" suffix, the XOR of every byte before '*'.

use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

use super::device::{
    AxisErrors, AxisId, AxisParam, AxisState, BoardInfo, ControlMode, OdriveDevice,
};
use super::error::{OdriveError, Result};

/// Default serial configuration for the ODrive UART / USB-CDC port
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Longest reply line accepted before giving up
const MAX_LINE: usize = 256;

/// Replies the firmware sends instead of a value
const REJECTIONS: [&str; 3] = ["invalid property", "invalid command format", "unknown command"];

/// Byte stream to a board that can throw away input nobody asked for yet
pub trait Port: Read + Write {
    fn discard_input(&mut self) -> Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// ASCII protocol bus - handles line-level communication with one board
pub struct AsciiBus<P = Box<dyn SerialPort>> {
    port: P,
}

impl AsciiBus {
    /// Open a new connection to the board
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }
}

impl<P: Port> AsciiBus<P> {
    /// Wrap an already opened byte stream
    pub fn new(port: P) -> Self {
        Self { port }
    }

    fn checksum(data: &[u8]) -> u8 {
        data.iter().fold(0, |acc, &b| acc ^ b)
    }

    /// Build a command line, optionally with checksum suffix
    fn build_command(command: &str, with_checksum: bool) -> Vec<u8> {
        let mut line = Vec::with_capacity(command.len() + 6);
        line.extend_from_slice(command.as_bytes());
        if with_checksum {
            let checksum = Self::checksum(command.as_bytes());
            line.extend_from_slice(format!("*{}", checksum).as_bytes());
        }
        line.push(b'\n');
        line
    }

    fn send_line(&mut self, line: &[u8]) -> Result<()> {
        self.port.write_all(line)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one reply line, without the line terminator
    fn read_line(&mut self, command: &str) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {
                    return Err(OdriveError::NoReply {
                        command: command.to_string(),
                    });
                }
                Ok(_) => match byte[0] {
                    b'\n' => break,
                    b'\r' => {}
                    b => line.push(b),
                },
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(OdriveError::NoReply {
                        command: command.to_string(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(OdriveError::Io(e)),
            }

            if line.len() > MAX_LINE {
                return Err(OdriveError::InvalidResponse {
                    command: command.to_string(),
                    reason: format!("reply longer than {} bytes", MAX_LINE),
                });
            }
        }

        String::from_utf8(line).map_err(|_| OdriveError::InvalidResponse {
            command: command.to_string(),
            reason: "reply is not UTF-8".to_string(),
        })
    }

    /// Strip and verify a trailing "*<xor>" if present
    fn verify_reply(command: &str, reply: &str) -> Result<String> {
        let Some((body, suffix)) = reply.rsplit_once('*') else {
            return Ok(reply.trim().to_string());
        };

        let received: u8 = suffix
            .trim()
            .parse()
            .map_err(|_| OdriveError::InvalidResponse {
                command: command.to_string(),
                reason: format!("bad checksum field: {:?}", suffix),
            })?;

        if Self::checksum(body.as_bytes()) != received {
            return Err(OdriveError::ChecksumMismatch {
                command: command.to_string(),
            });
        }
        Ok(body.trim().to_string())
    }

    /// Read a property, returning the raw reply text
    pub fn read_property(&mut self, path: &str) -> Result<String> {
        let command = format!("r {}", path);
        // A late reply to an earlier read, or a rejection of a write, would
        // otherwise be taken as the answer to this one
        self.port.discard_input()?;
        self.send_line(&Self::build_command(&command, true))?;

        let reply = self.read_line(&command)?;
        let value = Self::verify_reply(&command, &reply)?;

        if REJECTIONS.iter().any(|r| value.eq_ignore_ascii_case(r)) {
            return Err(OdriveError::Rejected {
                command,
                reply: value,
            });
        }
        debug!("Read {} = {}", path, value);
        Ok(value)
    }

    /// Write a property; the firmware does not acknowledge writes
    pub fn write_property(&mut self, path: &str, value: &str) -> Result<()> {
        let command = format!("w {} {}", path, value);
        debug!("Write {} = {}", path, value);
        self.send_line(&Self::build_command(&command, false))
    }

    fn parse<T: std::str::FromStr>(path: &str, raw: &str) -> Result<T> {
        raw.parse().map_err(|_| OdriveError::InvalidResponse {
            command: format!("r {}", path),
            reason: format!("cannot parse {:?}", raw),
        })
    }

    pub fn read_u32(&mut self, path: &str) -> Result<u32> {
        let raw = self.read_property(path)?;
        Self::parse(path, &raw)
    }

    pub fn read_u64(&mut self, path: &str) -> Result<u64> {
        let raw = self.read_property(path)?;
        Self::parse(path, &raw)
    }

    pub fn read_f32(&mut self, path: &str) -> Result<f32> {
        let raw = self.read_property(path)?;
        Self::parse(path, &raw)
    }

    pub fn read_bool(&mut self, path: &str) -> Result<bool> {
        let raw = self.read_property(path)?;
        match raw.as_str() {
            "1" | "True" | "true" => Ok(true),
            "0" | "False" | "false" => Ok(false),
            _ => Err(OdriveError::InvalidResponse {
                command: format!("r {}", path),
                reason: format!("not a boolean: {:?}", raw),
            }),
        }
    }

    fn read_u8(&mut self, path: &str) -> Result<u8> {
        let raw = self.read_property(path)?;
        Self::parse(path, &raw)
    }
}

/// Property path below one axis object
fn axis_path(axis: AxisId, suffix: &str) -> String {
    format!("axis{}.{}", axis.index(), suffix)
}

impl<P: Port> OdriveDevice for AsciiBus<P> {
    fn board_info(&mut self) -> Result<BoardInfo> {
        Ok(BoardInfo {
            hw_version_major: self.read_u8("hw_version_major")?,
            hw_version_minor: self.read_u8("hw_version_minor")?,
            hw_version_variant: self.read_u8("hw_version_variant")?,
            fw_version_major: self.read_u8("fw_version_major")?,
            fw_version_minor: self.read_u8("fw_version_minor")?,
            fw_version_revision: self.read_u8("fw_version_revision")?,
            fw_version_unreleased: self.read_bool("fw_version_unreleased")?,
            serial_number: self.read_u64("serial_number")?,
        })
    }

    fn vbus_voltage(&mut self) -> Result<f32> {
        self.read_f32("vbus_voltage")
    }

    fn encoder_cpr(&mut self, axis: AxisId) -> Result<u32> {
        self.read_u32(&axis_path(axis, "encoder.config.cpr"))
    }

    fn request_state(&mut self, axis: AxisId, state: AxisState) -> Result<()> {
        self.write_property(
            &axis_path(axis, "requested_state"),
            &(state as u8).to_string(),
        )
    }

    fn current_state(&mut self, axis: AxisId) -> Result<Option<AxisState>> {
        let raw = self.read_u8(&axis_path(axis, "current_state"))?;
        Ok(AxisState::from_raw(raw))
    }

    fn set_control_mode(&mut self, axis: AxisId, mode: ControlMode) -> Result<()> {
        self.write_property(
            &axis_path(axis, "controller.config.control_mode"),
            &(mode as u8).to_string(),
        )
    }

    fn set_vel_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()> {
        self.write_property(&axis_path(axis, "controller.vel_setpoint"), &value.to_string())
    }

    fn set_pos_setpoint(&mut self, axis: AxisId, value: f32) -> Result<()> {
        self.write_property(&axis_path(axis, "controller.pos_setpoint"), &value.to_string())
    }

    fn pos_setpoint(&mut self, axis: AxisId) -> Result<f32> {
        self.read_f32(&axis_path(axis, "controller.pos_setpoint"))
    }

    fn errors(&mut self, axis: AxisId) -> Result<AxisErrors> {
        Ok(AxisErrors {
            axis: self.read_u32(&axis_path(axis, "error"))?,
            motor: self.read_u32(&axis_path(axis, "motor.error"))?,
            encoder: self.read_u32(&axis_path(axis, "encoder.error"))?,
            controller: self.read_u32(&axis_path(axis, "controller.error"))?,
        })
    }

    fn clear_errors(&mut self, axis: AxisId) -> Result<()> {
        for suffix in ["error", "motor.error", "encoder.error", "controller.error"] {
            self.write_property(&axis_path(axis, suffix), "0")?;
        }
        Ok(())
    }

    fn motor_pre_calibrated(&mut self, axis: AxisId) -> Result<bool> {
        self.read_bool(&axis_path(axis, "motor.config.pre_calibrated"))
    }

    fn configure(&mut self, axis: AxisId, param: AxisParam) -> Result<()> {
        self.write_property(&axis_path(axis, param.path()), &param.wire_value())
    }

    fn set_brake_resistance(&mut self, ohms: f32) -> Result<()> {
        self.write_property("config.brake_resistance", &ohms.to_string())
    }

    fn save_configuration(&mut self) -> Result<()> {
        self.send_line(&Self::build_command("ss", false))
    }

    fn reboot(&mut self) -> Result<()> {
        match self.send_line(&Self::build_command("sr", false)) {
            Ok(()) => Ok(()),
            // The board drops USB while rebooting
            Err(OdriveError::Io(e)) => {
                debug!("Link dropped on reboot: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
