//! MSP command codes understood by this crate.

use std::fmt::{self, Display};

use crate::error::Error;

/// MSP v1 command codes.
///
/// Only codes with a known meaning are accepted when decoding a frame;
/// anything else is rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MspCode {
    /// Protocol and API version.
    ApiVersion = 1,
    /// Four character firmware identifier ("BTFL").
    FcVariant = 2,
    /// Firmware version.
    FcVersion = 3,
    /// Board identity and capabilities.
    BoardInfo = 4,
    /// Build date and time.
    BuildInfo = 5,
    /// Craft name.
    Name = 10,
    /// Reboot into firmware, bootloader or MSC mode.
    Reboot = 68,
    /// Legacy status block.
    Status = 101,
    /// Extended status block.
    StatusEx = 150,
    /// MCU unique id.
    Uid = 160,
    /// Reset configuration, optionally to custom defaults.
    ResetConf = 208,
    /// Persist the configuration to flash.
    EepromWrite = 250,
}

impl MspCode {
    /// Raw wire value.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MspCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MspCode::ApiVersion,
            2 => MspCode::FcVariant,
            3 => MspCode::FcVersion,
            4 => MspCode::BoardInfo,
            5 => MspCode::BuildInfo,
            10 => MspCode::Name,
            68 => MspCode::Reboot,
            101 => MspCode::Status,
            150 => MspCode::StatusEx,
            160 => MspCode::Uid,
            208 => MspCode::ResetConf,
            250 => MspCode::EepromWrite,
            other => {
                return Err(Error::MalformedFrame(format!("unknown command code {other}")));
            }
        })
    }
}

impl Display for MspCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Argument of [`MspCode::ResetConf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetType {
    /// Firmware built-in defaults.
    BaseDefaults = 0,
    /// Manufacturer defaults embedded in the image.
    CustomDefaults = 1,
}
