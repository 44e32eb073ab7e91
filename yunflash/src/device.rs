//! Board discovery and USB classification.
//!
//! The Yún family enumerates as a USB CDC serial port whose product ID tells
//! apart the 32u4 sketch side from its AVR boot-loader: both are usable as
//! the starting point of an update, since the first thing the updater does is
//! force the board into boot-loader mode anyway.

use crate::error::{Error, Result};
use log::{debug, trace};

/// Which side of the 32u4 is currently enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardMode {
    /// Application (sketch) CDC port.
    Sketch,
    /// AVR boot-loader CDC port.
    Bootloader,
}

impl BoardMode {
    /// Human-readable label.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sketch => "sketch mode",
            Self::Bootloader => "bootloader mode",
        }
    }
}

/// Known USB identities of the Yún family.
///
/// VID 0x2341 is Arduino SA, 0x2A03 is Arduino SRL; both shipped Yún boards
/// with the same product IDs.
const KNOWN_USB_DEVICES: &[(u16, u16, BoardMode)] = &[
    (0x2341, 0x8041, BoardMode::Sketch),
    (0x2341, 0x0041, BoardMode::Bootloader),
    (0x2A03, 0x8041, BoardMode::Sketch),
    (0x2A03, 0x0041, BoardMode::Bootloader),
];

/// Classify a VID/PID pair, `None` for anything that is not a Yún.
pub fn classify(vid: u16, pid: u16) -> Option<BoardMode> {
    KNOWN_USB_DEVICES
        .iter()
        .find(|(known_vid, known_pid, _)| vid == *known_vid && pid == *known_pid)
        .map(|(_, _, mode)| *mode)
}

/// Discovered serial endpoint information.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Board mode when the USB identity matches a Yún.
    pub mode: Option<BoardMode>,
    /// USB vendor ID, `None` for non-USB endpoints.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// Manufacturer string from the USB descriptor.
    pub manufacturer: Option<String>,
    /// Product string from the USB descriptor.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether this endpoint carries a Yún USB identity.
    pub fn is_yun(&self) -> bool {
        self.mode.is_some()
    }
}

/// Detect all available serial endpoints with USB metadata.
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("failed to enumerate serial ports: {e}");
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .map(|info| {
            let mut detected = DetectedPort {
                name: info.port_name,
                mode: None,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            };
            if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                detected.mode = classify(usb.vid, usb.pid);
                detected.vid = Some(usb.vid);
                detected.pid = Some(usb.pid);
                detected.manufacturer = usb.manufacturer;
                detected.product = usb.product;
                detected.serial = usb.serial_number;
                trace!(
                    "USB endpoint {} {:04X}:{:04X} {:?}",
                    detected.name, usb.vid, usb.pid, detected.mode
                );
            }
            detected
        })
        .collect()
}

/// Detect endpoints carrying a Yún USB identity.
pub fn detect_yun_ports() -> Vec<DetectedPort> {
    detect_ports().into_iter().filter(DetectedPort::is_yun).collect()
}

/// Auto-detect the port to update, preferring the first Yún identity found.
///
/// `target_board` only feeds the error message shown when nothing matches.
pub fn auto_detect_port(target_board: &str) -> Result<DetectedPort> {
    let ports = detect_yun_ports();
    match ports.into_iter().next() {
        Some(port) => {
            debug!(
                "auto-detected {} ({})",
                port.name,
                port.mode.map_or("unknown mode", |m| m.name())
            );
            Ok(port)
        }
        None => Err(Error::DeviceNotFound(target_board.to_string())),
    }
}
