//! Serial port discovery and classification.
//!
//! Boards running optiboot usually sit behind a USB-UART bridge. Knowing the
//! bridge lets the CLI pick a sensible port when none is given.

use crate::error::{Error, Result};
use crate::port::PortInfo;

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB bridge/device kinds found on AVR boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceKind {
    /// Microchip nEDBG/PKOB virtual COM port (Curiosity Nano boards).
    Microchip,
    /// Arduino board or ATmega16U2 bridge.
    Arduino,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs; an empty PID list matches the whole vendor.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x03EB, &[0x2175, 0x2111, 0x2145], DeviceKind::Microchip),
    (0x2341, &[], DeviceKind::Arduino),
    (0x2A03, &[], DeviceKind::Arduino),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Microchip => "Microchip nEDBG",
            Self::Arduino => "Arduino",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether auto-selection prefers this kind.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Microchip | Self::Arduino | Self::Ch340)
    }
}

/// A serial port with its classified bridge.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g. "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
        }
    }
}

/// Enumerate serial ports with their bridge kind.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let port = DetectedPort::from(info);
                trace!("Found port {} ({:?})", port.name, port.device);
                port
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Enumerate serial ports (no native serial support: always empty).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the most likely bootloader port out of `ports`.
///
/// Preference: high-priority bridges, then any known bridge, then the first
/// port.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports.iter().find(|p| p.device.is_high_priority()) {
        return Ok(port.clone());
    }
    if let Some(port) = ports.iter().find(|p| p.device.is_known()) {
        return Ok(port.clone());
    }
    ports.into_iter().next().ok_or(Error::DeviceNotFound)
}

/// Auto-detect a single port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports())?;
    info!("Auto-detected {} port: {}", port.device.name(), port.name);
    Ok(port)
}

/// Format detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x03EB, 0x2175), DeviceKind::Microchip);
        assert_eq!(DeviceKind::from_vid_pid(0x2341, 0x0043), DeviceKind::Arduino);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x03EB, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_port_info_classification() {
        assert_eq!(port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)).device, DeviceKind::Ch340);
        assert_eq!(port("/dev/ttyS0", None, None).device, DeviceKind::Unknown);
    }

    #[test]
    fn test_select_port_prefers_known_bridges() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x0403), Some(0x6001)),
            port("/dev/ttyACM0", Some(0x03EB), Some(0x2175)),
        ];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyACM0");

        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x0403), Some(0x6001)),
        ];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyUSB0");

        let ports = vec![port("/dev/ttyS0", None, None)];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyS0");

        assert!(matches!(select_port(Vec::new()), Err(Error::DeviceNotFound)));
    }

    #[test]
    fn test_format_port_list() {
        let mut ch340 = port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523));
        ch340.product = Some("USB-Serial".to_string());
        let ports = vec![
            ch340,
            port("/dev/ttyUSB1", Some(0x1234), Some(0x5678)),
            port("/dev/ttyS0", None, None),
        ];

        let formatted = format_port_list(&ports);

        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH341] - USB-Serial");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
