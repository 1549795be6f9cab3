//! USB DFU collaborator.
//!
//! The flasher only decides when to look for a DFU device and what to send
//! it. [`DfuBackend`] is the seam; [`UsbDfu`] implements it on top of
//! `nusb` and `dfu-nusb`.

use std::io::Cursor;

use crate::error::{Error, Result};

/// USB interface class of application-specific interfaces.
const USB_CLASS_APPLICATION: u8 = 0xFE;
/// Subclass identifying a DFU interface.
const USB_SUBCLASS_DFU: u8 = 0x01;

/// Device enumeration and image transfer for a DFU bootloader.
pub trait DfuBackend {
    /// Whether a DFU-mode device is currently enumerable.
    fn is_present(&mut self) -> Result<bool>;

    /// Write `image` to flash starting at `address`.
    fn download(&mut self, image: &[u8], address: u32) -> Result<()>;
}

/// DFU over USB using the first enumerated DFU interface.
#[derive(Debug, Default)]
pub struct UsbDfu {
    alt_setting: u8,
}

impl UsbDfu {
    /// Use alternate setting 0, the internal flash on STM32 bootloaders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another alternate setting of the DFU interface.
    pub fn with_alt_setting(alt_setting: u8) -> Self {
        UsbDfu { alt_setting }
    }

    fn find_device() -> Result<Option<(nusb::DeviceInfo, u8)>> {
        let devices = nusb::list_devices().map_err(|e| Error::Usb(e.to_string()))?;
        for device in devices {
            let dfu_interface = device
                .interfaces()
                .find(|i| i.class() == USB_CLASS_APPLICATION && i.subclass() == USB_SUBCLASS_DFU)
                .map(|i| i.interface_number());
            if let Some(interface) = dfu_interface {
                return Ok(Some((device, interface)));
            }
        }
        Ok(None)
    }
}

impl DfuBackend for UsbDfu {
    fn is_present(&mut self) -> Result<bool> {
        Ok(Self::find_device()?.is_some())
    }

    fn download(&mut self, image: &[u8], address: u32) -> Result<()> {
        let (info, interface_number) = Self::find_device()?
            .ok_or_else(|| Error::Transfer("no DFU device to download to".into()))?;
        tracing::info!(
            vid = format_args!("{:04x}", info.vendor_id()),
            pid = format_args!("{:04x}", info.product_id()),
            address = format_args!("0x{address:08X}"),
            len = image.len(),
            "DFU download"
        );

        let device = info.open().map_err(|e| Error::Usb(e.to_string()))?;
        let interface = device
            .claim_interface(interface_number)
            .map_err(|e| Error::Usb(e.to_string()))?;
        let dfu = dfu_nusb::DfuNusb::open(device, interface, self.alt_setting)
            .map_err(|e| Error::Transfer(e.to_string()))?;

        let length = u32::try_from(image.len())
            .map_err(|_| Error::Transfer(format!("image of {} bytes is too large", image.len())))?;
        dfu.into_sync_dfu()
            .override_address(address)
            .download(Cursor::new(image), length)
            .map_err(|e| Error::Transfer(e.to_string()))
    }
}
