//! High-level flashing session for a Betaflight flight controller
//!
//! Sequences bootloader entry, DFU discovery, image transfer, serial
//! rediscovery and custom-defaults application.

use std::time::Duration;

use anyhow::Context;

use crate::build_info::BuildInfo;
use crate::codes::{MspCode, ResetType};
use crate::device::DeviceState;
use crate::dfu::DfuBackend;
use crate::error::Error;
use crate::firmware::{FirmwareImage, PatchOutcome};
use crate::msplink::MspLink;
use crate::options::FlashOptions;
use crate::serial::SerialPorts;

/// CLI-mode entry; the firmware answers with its `#` prompt.
pub const ENTER_CLI: &[u8] = b"#\n";
/// CLI command rebooting into the DFU bootloader.
pub const REBOOT_TO_BOOTLOADER: &[u8] = b"bl\n";

/// Result of the transfer step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    /// The DFU primitive finished without error.
    Flashed,
    /// The DFU primitive failed; the session went on regardless.
    Failed(String),
}

/// Result of the custom-defaults step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultsOutcome {
    /// The reset-to-custom-defaults command was sent.
    ///
    /// `acknowledged` is false when no response arrived before the
    /// acknowledgement timeout. That is expected: the device may reboot
    /// before it answers.
    Applied {
        /// Whether a response frame was read.
        acknowledged: bool,
    },
    /// The device has no pending custom defaults, or cannot apply them.
    NotSupported,
}

/// Everything a completed session did.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// What happened to the custom defaults blob.
    pub patch: PatchOutcome,
    /// Result of the transfer.
    pub flash: FlashOutcome,
    /// Device model read back after flashing.
    pub device: DeviceState,
    /// Result of the custom-defaults step.
    pub defaults: DefaultsOutcome,
}

/// Flashing session for one flight controller
///
/// The session owns its collaborators and the name of the serial port for
/// its whole duration. Steps run strictly one after another; the two waits
/// are bounded by [`FlashOptions::poll_attempts`].
///
/// # Example
///
/// ```no_run
/// # async fn example() -> anyhow::Result<()> {
/// use bfflash::{FirmwareImage, Flasher, FlashOptions, SystemSerialPorts, UsbDfu};
/// use bfflash::build_info::BuildInfo;
///
/// let image = FirmwareImage::load("betaflight_4.5.1_STM32F7X2_SPEEDYBEEF7V3.hex")?;
/// let mut flasher = Flasher::new(UsbDfu::new(), SystemSerialPorts, "/dev/ttyACM0", FlashOptions::default());
/// let report = flasher.run(image, &BuildInfo::default()).await?;
/// println!("{:?}", report.defaults);
/// # Ok(())
/// # }
/// ```
pub struct Flasher<D, S> {
    dfu: D,
    ports: S,
    port: String,
    options: FlashOptions,
}

impl<D: DfuBackend, S: SerialPorts> Flasher<D, S> {
    /// Create a session for the device on serial port `port`.
    pub fn new(dfu: D, ports: S, port: impl Into<String>, options: FlashOptions) -> Self {
        Flasher { dfu, ports, port: port.into(), options }
    }

    /// Serial port of the device.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// DFU collaborator.
    pub fn dfu(&self) -> &D {
        &self.dfu
    }

    /// Serial collaborator.
    pub fn ports(&self) -> &S {
        &self.ports
    }

    /// Run every step of a flashing session
    ///
    /// # Arguments
    ///
    /// * `image` - The firmware to flash, patched here with the build's custom defaults
    /// * `build_info` - Metadata of the build the image belongs to
    ///
    /// # Errors
    ///
    /// Fails with [`Error::DeviceAbsent`] when the DFU device or the serial
    /// port does not show up, or when talking to the device after flashing
    /// fails. A failed transfer is not an error; see [`SessionReport::flash`].
    pub async fn run(&mut self, mut image: FirmwareImage, build_info: &BuildInfo) -> anyhow::Result<SessionReport> {
        let patch = prepare_image(&mut image, build_info);

        self.ensure_bootloader().await.context("entering bootloader")?;
        self.await_dfu().await?;
        let flash = self.flash(&image).await;
        self.await_serial().await?;
        let (device, defaults) = self.apply_custom_defaults().await?;

        Ok(SessionReport { patch, flash, device, defaults })
    }

    /// Ask the running firmware to reboot into its DFU bootloader
    ///
    /// Nothing is sent if a DFU device is already present.
    ///
    /// # Returns
    ///
    /// `true` if the reboot was requested, `false` if it was skipped
    pub async fn ensure_bootloader(&mut self) -> anyhow::Result<bool> {
        if self.dfu.is_present()? {
            tracing::info!("DFU device already present");
            return Ok(false);
        }

        let port = self.ports.open(&self.port, self.options.baud_rate)
            .with_context(|| format!("open {}", self.port))?;
        let mut link = MspLink::new(port);
        link.send_raw(ENTER_CLI).await?;
        tokio::time::sleep(self.options.settle_delay).await;
        link.send_raw(REBOOT_TO_BOOTLOADER).await?;
        tracing::info!(port = %self.port, "bootloader requested");
        Ok(true)
    }

    /// Wait for a DFU device to enumerate.
    pub async fn await_dfu(&mut self) -> anyhow::Result<()> {
        let FlashOptions { poll_attempts, poll_interval, .. } = self.options;
        let dfu = &mut self.dfu;
        poll_until("DFU device", poll_attempts, poll_interval, || dfu.is_present()).await
    }

    /// Transfer `image` through DFU, starting at its minimum address
    ///
    /// A transfer failure is logged and reported, never raised, so the
    /// session can still reach the configuration step.
    pub async fn flash(&mut self, image: &FirmwareImage) -> FlashOutcome {
        let binary = image.to_binary();
        let origin = image.min_address();
        tracing::info!(origin = format_args!("0x{origin:08X}"), len = binary.len(), "flashing");

        match self.dfu.download(&binary, origin) {
            Ok(()) => {
                tracing::info!("flash done");
                FlashOutcome::Flashed
            }
            Err(e) => {
                tracing::error!(error = %e, "flash failed");
                FlashOutcome::Failed(e.to_string())
            }
        }
    }

    /// Wait for the serial port to come back after flashing.
    pub async fn await_serial(&mut self) -> anyhow::Result<()> {
        let FlashOptions { poll_attempts, poll_interval, .. } = self.options;
        let (ports, port) = (&self.ports, &self.port);
        let what = format!("serial port {port}");
        poll_until(&what, poll_attempts, poll_interval, || ports.is_present(port)).await
    }

    /// Identify the device and apply its custom defaults when due
    ///
    /// The reset is sent only when the device supports custom defaults, has
    /// some, and still runs bare defaults. The device usually reboots right
    /// away, so a missing acknowledgement counts as success.
    ///
    /// # Returns
    ///
    /// The identified device and what was done
    pub async fn apply_custom_defaults(&mut self) -> anyhow::Result<(DeviceState, DefaultsOutcome)> {
        let port = self.ports.open(&self.port, self.options.baud_rate)
            .with_context(|| format!("open {}", self.port))?;
        let mut link = MspLink::new(port);

        let mut device = DeviceState::new();
        link.identify(&mut device, self.options.request_timeout)
            .await
            .context("identifying device")?;
        tracing::info!(
            target_name = %device.target_name,
            board = %device.board_name,
            version = %device.flight_controller_version,
            build = %device.build_info,
            "device identified"
        );

        if !device.custom_defaults_pending() {
            tracing::warn!(
                capabilities = device.target_capabilities.0,
                state = ?device.configuration_state,
                "custom defaults not supported"
            );
            return Ok((device, DefaultsOutcome::NotSupported));
        }

        link.send(MspCode::ResetConf, &[ResetType::CustomDefaults as u8]).await?;
        let acknowledged = match tokio::time::timeout(self.options.ack_timeout, link.read_frame()).await {
            Ok(Ok(frame)) => {
                tracing::info!(%frame, "custom defaults applied");
                true
            }
            Ok(Err(e)) => {
                tracing::info!(error = %e, "custom defaults applied, device went away before acknowledging");
                false
            }
            Err(_) => {
                tracing::info!("custom defaults applied, no acknowledgement");
                false
            }
        };
        Ok((device, DefaultsOutcome::Applied { acknowledged }))
    }
}

/// Call `present` up to `attempts` times, `interval` apart, until it
/// reports true.
///
/// Enumeration errors count as "not present".
///
/// # Errors
///
/// Returns [`Error::DeviceAbsent`] naming `what` once every attempt failed.
pub async fn poll_until<F>(what: &str, attempts: u32, interval: Duration, mut present: F) -> anyhow::Result<()>
where
    F: FnMut() -> crate::error::Result<bool>,
{
    for attempt in 1..=attempts {
        match present() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "enumeration failed"),
        }
        if attempt < attempts {
            tracing::info!(attempt, "waiting for {what}");
            tokio::time::sleep(interval).await;
        }
    }
    Err(Error::DeviceAbsent { what: what.to_string(), attempts }.into())
}

/// Patch `image` with the configuration carried by `build_info`.
pub fn prepare_image(image: &mut FirmwareImage, build_info: &BuildInfo) -> PatchOutcome {
    let outcome = image.patch_custom_defaults(build_info.configuration_lines());
    match outcome {
        PatchOutcome::Patched { start, len } => {
            tracing::info!(start = format_args!("0x{start:08X}"), len, "custom defaults embedded")
        }
        PatchOutcome::NoConfiguration => tracing::debug!("build carries no custom defaults"),
        other => tracing::info!(?other, "custom defaults not embedded, flashing unpatched image"),
    }
    outcome
}
