// Locating an ODrive on the serial ports of the host

use std::thread::sleep;
use std::time::{Duration, Instant};

use serialport::SerialPortType;
use tracing::{debug, info};

use super::ascii::{AsciiBus, DEFAULT_BAUDRATE};
use super::device::OdriveDevice;
use super::error::{OdriveError, Result};

/// USB identifiers of ODrive boards
pub const ODRIVE_VID: u16 = 0x1209;
pub const ODRIVE_PIDS: [u16; 2] = [0x0D32, 0x0D33];

/// Delay between discovery sweeps
const RESCAN_INTERVAL: Duration = Duration::from_millis(500);

/// What to look for and how long to keep looking
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub port: Option<String>,
    pub timeout: Duration,
    pub serial_number: Option<String>,
}

impl DiscoveryQuery {
    /// True if the filter is unset or names this serial number (hex, case-insensitive)
    pub fn matches_serial(&self, serial_number: u64) -> bool {
        match &self.serial_number {
            None => true,
            Some(wanted) => format!("{:X}", serial_number).eq_ignore_ascii_case(wanted.trim()),
        }
    }
}

/// Source of device handles for the axis controller
pub trait DeviceFinder {
    type Device: OdriveDevice;

    /// Block until a matching device is found or the query times out
    fn find(&mut self, query: &DiscoveryQuery) -> Result<Self::Device>;
}

/// Finds boards over USB-CDC / UART using the ASCII protocol
#[derive(Debug, Clone)]
pub struct SerialFinder {
    pub baudrate: u32,
}

impl Default for SerialFinder {
    fn default() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
        }
    }
}

impl SerialFinder {
    fn candidates(query: &DiscoveryQuery) -> Vec<String> {
        if let Some(port) = &query.port {
            return vec![port.clone()];
        }

        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter(|p| match &p.port_type {
                    SerialPortType::UsbPort(usb) => {
                        usb.vid == ODRIVE_VID && ODRIVE_PIDS.contains(&usb.pid)
                    }
                    _ => false,
                })
                .map(|p| p.port_name)
                .collect(),
            Err(e) => {
                debug!("Port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    fn probe(&self, port: &str, query: &DiscoveryQuery) -> Result<Option<AsciiBus>> {
        let mut bus = AsciiBus::open_with_baudrate(port, self.baudrate)?;
        let serial_number = bus.read_u64("serial_number")?;

        if query.matches_serial(serial_number) {
            info!("Found ODrive {:X} on {}", serial_number, port);
            Ok(Some(bus))
        } else {
            debug!("Skipping ODrive {:X} on {}", serial_number, port);
            Ok(None)
        }
    }
}

impl DeviceFinder for SerialFinder {
    type Device = AsciiBus;

    fn find(&mut self, query: &DiscoveryQuery) -> Result<AsciiBus> {
        let deadline = Instant::now() + query.timeout;

        loop {
            for port in Self::candidates(query) {
                match self.probe(&port, query) {
                    Ok(Some(bus)) => return Ok(bus),
                    Ok(None) => {}
                    Err(e) => debug!("No ODrive on {}: {}", port, e),
                }
            }

            if Instant::now() >= deadline {
                return Err(OdriveError::NotFound {
                    timeout: query.timeout,
                });
            }
            sleep(RESCAN_INTERVAL);
        }
    }
}
