//! Error types for bfflash.
//!
//! Codec and transport layers return [`Result<T>`] with [`Error`]. The
//! high-level flows in [`flasher`](crate::flasher) and [`backup`](crate::backup)
//! wrap these in `anyhow` context; the typed value can be recovered with
//! `downcast_ref::<Error>()`.

use std::time::Duration;

/// The error type for protocol, transport and image operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame carried an unknown direction marker, an unknown command code,
    /// or a length byte that does not match its payload.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A mandatory field ran past the end of the payload.
    #[error("truncated payload: missing {0}")]
    Truncated(&'static str),

    /// The device answered with the unsupported-command marker.
    #[error("command {0} is not supported by the device")]
    Unsupported(u8),

    /// A bounded poll ran out waiting for a device to appear.
    #[error("device not found: {what} after {attempts} attempts")]
    DeviceAbsent {
        /// What was being waited for (DFU device, serial port name).
        what: String,
        /// Number of polls made.
        attempts: u32,
    },

    /// The DFU transfer primitive failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// No response arrived within the deadline.
    #[error("timeout after {0:?} waiting for response")]
    Timeout(Duration),

    /// The serial port could not be enumerated or opened.
    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// USB enumeration failed.
    #[error("usb error: {0}")]
    Usb(String),

    /// The firmware file is not valid Intel HEX.
    #[error("invalid hex file: {0}")]
    HexFormat(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_absent_names_what_was_awaited() {
        let e = Error::DeviceAbsent { what: "serial port /dev/ttyACM0".into(), attempts: 10 };
        assert_eq!(e.to_string(), "device not found: serial port /dev/ttyACM0 after 10 attempts");
    }

    #[test]
    fn malformed_frame_display() {
        let e = Error::MalformedFrame("unknown direction marker 0x3F".into());
        assert_eq!(e.to_string(), "malformed frame: unknown direction marker 0x3F");
    }

    #[test]
    fn timeout_display_includes_duration() {
        let e = Error::Timeout(Duration::from_millis(250));
        assert_eq!(e.to_string(), "timeout after 250ms waiting for response");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_survives_anyhow_round_trip() {
        let e: anyhow::Error = Error::DeviceAbsent { what: "DFU device".into(), attempts: 3 }.into();
        let e = e.context("waiting for bootloader");
        assert!(matches!(e.downcast_ref::<Error>(), Some(Error::DeviceAbsent { .. })));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<Error>();
    }
}
