//! # Device model decoded from MSP responses
//!
//! [`DeviceState`] starts empty at the beginning of a session and fills in
//! field by field as response frames are passed to
//! [`DeviceState::decode`]. Some board-info fields only exist on newer
//! firmware; which ones are read is decided by [`BOARD_INFO_GATES`], keyed
//! on the API version decoded earlier in the session.

use std::fmt::{self, Display};

use crate::codes::MspCode;
use crate::error::{Error, Result};
use crate::packets::{Direction, Frame};
use crate::payload::Payload;

/// Length of the board signature in a board-info response.
pub const SIGNATURE_LENGTH: usize = 32;
// "Mar 21 2024" followed directly by "12:00:00"
const BUILD_DATE_LENGTH: usize = 11;
const BUILD_INFO_LENGTH: usize = 19;

/// MSP API version as reported by the api-version query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ApiVersion {
    /// Major part.
    pub major: u8,
    /// Minor part.
    pub minor: u8,
}

impl ApiVersion {
    /// First version reporting the configuration state.
    pub const V1_42: ApiVersion = ApiVersion::new(1, 42);
    /// First version reporting sample rate and configuration problems.
    pub const V1_43: ApiVersion = ApiVersion::new(1, 43);

    /// Build a version from its parts.
    pub const fn new(major: u8, minor: u8) -> Self {
        ApiVersion { major, minor }
    }
}

impl Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.0", self.major, self.minor)
    }
}

/// Bit positions of the board-info capability field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Capability {
    /// USB virtual COM port.
    HasVcp = 0,
    /// Software serial support.
    HasSoftserial = 1,
    /// Unified target build.
    IsUnified = 2,
    /// Flash bootloader present.
    HasFlashBootloader = 3,
    /// Firmware can apply custom defaults.
    SupportsCustomDefaults = 4,
    /// The image carries custom defaults.
    HasCustomDefaults = 5,
    /// Receiver bind over MSP.
    SupportsRxBind = 6,
}

/// Capability bit-field from board info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetCapabilities(pub u8);

impl TargetCapabilities {
    /// Whether `capability` is set.
    pub fn has(self, capability: Capability) -> bool {
        bit_check(self.0, capability as u8)
    }
}

/// Whether bit `bit` of `value` is set.
pub fn bit_check(value: u8, bit: u8) -> bool {
    (value >> bit) & 1 != 0
}

/// Configuration state reported on API 1.42 and later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigurationState {
    /// Running the firmware's built-in defaults.
    #[default]
    DefaultsBare,
    /// Running the manufacturer's custom defaults.
    DefaultsCustom,
    /// Explicitly configured by the user.
    Configured,
    /// A value this crate does not know.
    Unknown(u8),
}

impl From<u8> for ConfigurationState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConfigurationState::DefaultsBare,
            1 => ConfigurationState::DefaultsCustom,
            2 => ConfigurationState::Configured,
            other => ConfigurationState::Unknown(other),
        }
    }
}

/// Board-info fields that only exist from some API version on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedField {
    /// `u8` configuration state.
    ConfigurationState,
    /// `u16` gyro sample rate in Hz.
    SampleRate,
    /// `u32` configuration-problem bit-field.
    ConfigurationProblems,
}

/// Trailing board-info fields, in wire order, with the API version that
/// introduced each one.
pub const BOARD_INFO_GATES: [(ApiVersion, GatedField); 3] = [
    (ApiVersion::V1_42, GatedField::ConfigurationState),
    (ApiVersion::V1_43, GatedField::SampleRate),
    (ApiVersion::V1_43, GatedField::ConfigurationProblems),
];

/// Everything learned about the connected device during one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// MSP protocol version.
    pub msp_protocol_version: u8,
    /// API version; 0.0.0 until the api-version response is decoded.
    pub api_version: ApiVersion,
    /// Firmware identifier, e.g. `BTFL`.
    pub flight_controller_identifier: String,
    /// Firmware version, e.g. `4.5.1`.
    pub flight_controller_version: String,
    /// Build date and time.
    pub build_info: String,
    /// Four character board identifier.
    pub board_identifier: String,
    /// Hardware revision.
    pub board_version: u16,
    /// Board type.
    pub board_type: u8,
    /// Capability bit-field.
    pub target_capabilities: TargetCapabilities,
    /// Firmware target name.
    pub target_name: String,
    /// Board name.
    pub board_name: String,
    /// Manufacturer id.
    pub manufacturer_id: String,
    /// Board signature.
    pub signature: [u8; SIGNATURE_LENGTH],
    /// MCU type id, 255 until known.
    pub mcu_type_id: u8,
    /// Configuration state, API 1.42+.
    pub configuration_state: ConfigurationState,
    /// Gyro sample rate in Hz, API 1.43+.
    pub sample_rate_hz: u16,
    /// Configuration-problem bit-field, API 1.43+, 0 otherwise.
    pub configuration_problems: u32,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            msp_protocol_version: 0,
            api_version: ApiVersion::default(),
            flight_controller_identifier: String::new(),
            flight_controller_version: String::new(),
            build_info: String::new(),
            board_identifier: String::new(),
            board_version: 0,
            board_type: 0,
            target_capabilities: TargetCapabilities::default(),
            target_name: String::new(),
            board_name: String::new(),
            manufacturer_id: String::new(),
            signature: [0; SIGNATURE_LENGTH],
            mcu_type_id: 255,
            configuration_state: ConfigurationState::default(),
            sample_rate_hz: 0,
            configuration_problems: 0,
        }
    }
}

impl DeviceState {
    /// Create an empty state for a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one response frame into the state.
    ///
    /// Frames for commands that carry no device-model fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] for an unsupported-command frame and
    /// [`Error::Truncated`] if a mandatory field is missing from the payload.
    pub fn decode(&mut self, frame: &Frame) -> Result<()> {
        if frame.direction() == Direction::Unsupported {
            return Err(Error::Unsupported(frame.code().code()));
        }

        let mut payload = frame.payload();
        match frame.code() {
            MspCode::ApiVersion => {
                self.msp_protocol_version = required(payload.read_u8(), "msp protocol version")?;
                let major = required(payload.read_u8(), "api major version")?;
                let minor = required(payload.read_u8(), "api minor version")?;
                self.api_version = ApiVersion::new(major, minor);
            }
            MspCode::FcVariant => {
                self.flight_controller_identifier = required(payload.read_string(4), "controller identifier")?;
            }
            MspCode::FcVersion => {
                let major = required(payload.read_u8(), "controller major version")?;
                let minor = required(payload.read_u8(), "controller minor version")?;
                let patch = required(payload.read_u8(), "controller patch version")?;
                self.flight_controller_version = format!("{major}.{minor}.{patch}");
            }
            MspCode::BuildInfo => {
                let data = frame.data();
                let mut raw = data[..data.len().min(BUILD_INFO_LENGTH)].to_vec();
                raw.insert(BUILD_DATE_LENGTH.min(raw.len()), b' ');
                self.build_info = String::from_utf8_lossy(&raw).into_owned();
            }
            MspCode::BoardInfo => self.decode_board_info(&mut payload)?,
            other => tracing::debug!(code = %other, "no device fields in response"),
        }
        Ok(())
    }

    fn decode_board_info(&mut self, payload: &mut Payload<'_>) -> Result<()> {
        self.board_identifier = required(payload.read_string(4), "board identifier")?;
        self.board_version = required(payload.read_u16(), "board version")?;
        self.board_type = required(payload.read_u8(), "board type")?;
        self.target_capabilities = TargetCapabilities(required(payload.read_u8(), "target capabilities")?);
        self.target_name = required(payload.read_string(0), "target name")?;
        self.board_name = required(payload.read_string(0), "board name")?;
        self.manufacturer_id = required(payload.read_string(0), "manufacturer id")?;
        let signature = required(payload.read_bytes(SIGNATURE_LENGTH), "signature")?;
        self.signature.copy_from_slice(signature);
        self.mcu_type_id = required(payload.read_u8(), "mcu type id")?;

        for (since, field) in BOARD_INFO_GATES {
            if self.api_version < since {
                if field == GatedField::ConfigurationProblems {
                    self.configuration_problems = 0;
                }
                continue;
            }
            let present = match field {
                GatedField::ConfigurationState => payload
                    .read_u8()
                    .map(|v| self.configuration_state = ConfigurationState::from(v)),
                GatedField::SampleRate => payload.read_u16().map(|v| self.sample_rate_hz = v),
                GatedField::ConfigurationProblems => payload.read_u32().map(|v| self.configuration_problems = v),
            };
            if present.is_none() {
                tracing::debug!(?field, api = %self.api_version, "board info ended before gated field");
            }
        }
        Ok(())
    }

    /// Whether the device carries custom defaults it has not applied yet.
    pub fn custom_defaults_pending(&self) -> bool {
        self.target_capabilities.has(Capability::SupportsCustomDefaults)
            && self.target_capabilities.has(Capability::HasCustomDefaults)
            && self.configuration_state == ConfigurationState::DefaultsBare
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T> {
    value.ok_or(Error::Truncated(field))
}
