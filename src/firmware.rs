//! # Sparse firmware images and custom-defaults patching
//!
//! A [`FirmwareImage`] maps absolute flash addresses to bytes, the way an
//! Intel HEX file describes them; gaps are unprogrammed flash. Before
//! flashing, the textual configuration carried by the build metadata is
//! injected into free space above [`CUSTOM_DEFAULTS_POINTER_ADDRESS`], where
//! the firmware looks for its custom defaults.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Addresses at or above this one may host the custom defaults blob.
pub const CUSTOM_DEFAULTS_POINTER_ADDRESS: u32 = 0x0800_2800;
/// First line of every custom defaults blob.
pub const CUSTOM_DEFAULTS_HEADER: &str = "# Betaflight\n";
/// Value of erased flash, used to fill gaps in a flat binary.
pub const ERASED_BYTE: u8 = 0xFF;

/// Sparse address to byte mapping of a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareImage {
    data: BTreeMap<u32, u8>,
}

/// Free region the custom defaults blob may be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectionWindow {
    /// First free address.
    pub start: u32,
    /// Number of free bytes up to the next programmed address.
    pub size: u32,
}

/// What [`FirmwareImage::patch_custom_defaults`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The blob was written at `start`.
    Patched {
        /// Address of the first blob byte.
        start: u32,
        /// Blob length including header and terminator.
        len: usize,
    },
    /// No configuration lines were given.
    NoConfiguration,
    /// No gap above the pointer address.
    NoWindow,
    /// The blob is larger than the window.
    TooLarge {
        /// Blob length.
        needed: usize,
        /// Window size.
        available: u32,
    },
}

impl FirmwareImage {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse Intel HEX text.
    ///
    /// Extended segment and extended linear address records are honoured;
    /// start address records are ignored.
    pub fn from_ihex(text: &str) -> Result<Self> {
        let mut image = FirmwareImage::new();
        let mut base = 0u32;

        for record in ihex::Reader::new(text) {
            match record.map_err(|e| Error::HexFormat(e.to_string()))? {
                ihex::Record::Data { offset, value } => {
                    let start = base.wrapping_add(offset as u32);
                    for (i, byte) in value.into_iter().enumerate() {
                        image.data.insert(start.wrapping_add(i as u32), byte);
                    }
                }
                ihex::Record::ExtendedSegmentAddress(segment) => base = (segment as u32) << 4,
                ihex::Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                ihex::Record::EndOfFile => break,
                ihex::Record::StartSegmentAddress { .. } | ihex::Record::StartLinearAddress(_) => {}
            }
        }
        Ok(image)
    }

    /// Read and parse an Intel HEX file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ihex(&text)
    }

    /// Lowest programmed address, 0 for an empty image.
    pub fn min_address(&self) -> u32 {
        self.data.keys().next().copied().unwrap_or(0)
    }

    /// Highest programmed address, 0 for an empty image.
    pub fn max_address(&self) -> u32 {
        self.data.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of programmed bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no byte is programmed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte at `address`, if programmed.
    pub fn get(&self, address: u32) -> Option<u8> {
        self.data.get(&address).copied()
    }

    /// Program one byte.
    pub fn set(&mut self, address: u32, value: u8) {
        self.data.insert(address, value);
    }

    /// Flat binary from the minimum to the maximum address, gaps erased.
    pub fn to_binary(&self) -> Vec<u8> {
        if self.data.is_empty() {
            return Vec::new();
        }
        let min = self.min_address();
        let mut binary = vec![ERASED_BYTE; (self.max_address() - min) as usize + 1];
        for (&address, &byte) in &self.data {
            binary[(address - min) as usize] = byte;
        }
        binary
    }

    /// Find where the custom defaults blob can go
    ///
    /// Addresses are walked in ascending order. Every gap that starts at or
    /// above [`CUSTOM_DEFAULTS_POINTER_ADDRESS`] replaces the previous
    /// candidate, so the last qualifying gap is returned, not the first or
    /// the largest.
    pub fn find_injection_window(&self) -> Option<InjectionWindow> {
        let mut window = None;
        let mut prev = self.min_address();
        for &address in self.data.keys() {
            if prev >= CUSTOM_DEFAULTS_POINTER_ADDRESS && address - prev > 1 {
                let start = prev + 1;
                window = Some(InjectionWindow { start, size: address - start });
            }
            prev = address;
        }
        window
    }

    /// Inject `lines` as a custom defaults blob
    ///
    /// The image is left untouched when there is nothing to write, no window,
    /// or the blob does not fit. Bytes of the window past the end of the blob
    /// are not written.
    pub fn patch_custom_defaults(&mut self, lines: &[String]) -> PatchOutcome {
        if lines.is_empty() {
            return PatchOutcome::NoConfiguration;
        }
        let Some(window) = self.find_injection_window() else {
            return PatchOutcome::NoWindow;
        };
        let blob = custom_defaults_blob(lines);
        if blob.len() > window.size as usize {
            return PatchOutcome::TooLarge { needed: blob.len(), available: window.size };
        }

        for (address, byte) in (window.start..).zip(blob.iter()) {
            self.data.insert(address, *byte);
        }
        PatchOutcome::Patched { start: window.start, len: blob.len() }
    }
}

/// Header, newline-joined `lines` and a terminating NUL.
pub fn custom_defaults_blob(lines: &[String]) -> Vec<u8> {
    let mut blob = CUSTOM_DEFAULTS_HEADER.as_bytes().to_vec();
    blob.extend_from_slice(lines.join("\n").as_bytes());
    blob.push(0);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = CUSTOM_DEFAULTS_POINTER_ADDRESS;

    fn image(ranges: &[(u32, u32)]) -> FirmwareImage {
        let mut image = FirmwareImage::new();
        for &(start, end) in ranges {
            for address in start..end {
                image.set(address, (address & 0xFF) as u8);
            }
        }
        image
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blob_layout() {
        let blob = custom_defaults_blob(&lines(&["set a = 1", "set b = 2"]));
        assert_eq!(blob, b"# Betaflight\nset a = 1\nset b = 2\0");
    }

    #[test]
    fn empty_configuration_leaves_image_identical() {
        let mut patched = image(&[(BASE, BASE + 4), (BASE + 100, BASE + 104)]);
        let original = patched.clone();
        assert_eq!(patched.patch_custom_defaults(&[]), PatchOutcome::NoConfiguration);
        assert_eq!(patched, original);
    }

    #[test]
    fn single_gap_receives_blob_after_previous_address() {
        let mut img = image(&[(BASE - 16, BASE + 4), (BASE + 200, BASE + 204)]);
        let config = lines(&["set gyro_lpf1_static_hz = 0"]);
        let outcome = img.patch_custom_defaults(&config);

        let blob = custom_defaults_blob(&config);
        let start = BASE + 4;
        assert_eq!(outcome, PatchOutcome::Patched { start, len: blob.len() });
        for (i, byte) in blob.iter().enumerate() {
            assert_eq!(img.get(start + i as u32), Some(*byte));
        }
        // The rest of the window stays unprogrammed.
        assert_eq!(img.get(start + blob.len() as u32), None);
        assert_eq!(img.get(BASE + 200), Some(((BASE + 200) & 0xFF) as u8));
    }

    #[test]
    fn blob_larger_than_gap_leaves_image_unmodified() {
        let mut img = image(&[(BASE, BASE + 4), (BASE + 10, BASE + 12)]);
        let original = img.clone();
        let outcome = img.patch_custom_defaults(&lines(&["set name = a_rather_long_craft_name"]));
        assert!(matches!(outcome, PatchOutcome::TooLarge { available: 6, .. }));
        assert_eq!(img, original);
    }

    #[test]
    fn blob_exactly_filling_gap_fits() {
        let config = lines(&["x"]);
        let len = custom_defaults_blob(&config).len() as u32;
        let mut img = image(&[(BASE, BASE + 1), (BASE + 1 + len, BASE + 2 + len)]);
        assert!(matches!(img.patch_custom_defaults(&config), PatchOutcome::Patched { .. }));
    }

    #[test]
    fn gaps_below_pointer_address_are_ignored() {
        let img = image(&[(BASE - 100, BASE - 90), (BASE - 10, BASE - 5)]);
        assert_eq!(img.find_injection_window(), None);
    }

    #[test]
    fn gap_straddling_pointer_address_is_ignored() {
        let img = image(&[(BASE - 100, BASE - 90), (BASE + 10, BASE + 12)]);
        assert_eq!(img.find_injection_window(), None);
    }

    // Later gaps win even when an earlier one is larger. This mirrors the
    // firmware tooling the images are built for; keep it unless the layout
    // contract changes.
    #[test]
    fn last_qualifying_gap_wins_over_larger_earlier_gap() {
        let img = image(&[(BASE, BASE + 2), (BASE + 1000, BASE + 1002), (BASE + 1010, BASE + 1011)]);
        assert_eq!(img.find_injection_window(), Some(InjectionWindow { start: BASE + 1002, size: 8 }));
    }

    #[test]
    fn last_gap_too_small_means_no_patch_even_if_earlier_gap_fits() {
        let mut img = image(&[(BASE, BASE + 2), (BASE + 1000, BASE + 1002), (BASE + 1005, BASE + 1006)]);
        let outcome = img.patch_custom_defaults(&lines(&["set a = 1"]));
        assert!(matches!(outcome, PatchOutcome::TooLarge { available: 3, .. }));
    }

    #[test]
    fn contiguous_image_has_no_window() {
        let mut img = image(&[(BASE, BASE + 64)]);
        assert_eq!(img.patch_custom_defaults(&lines(&["set a = 1"])), PatchOutcome::NoWindow);
    }

    #[test]
    fn ihex_with_extended_linear_address() {
        let text = ":020000040800F2\n:0400000001020304F2\n:02001000AABB89\n:00000001FF\n";
        let img = FirmwareImage::from_ihex(text).unwrap();
        assert_eq!(img.min_address(), 0x0800_0000);
        assert_eq!(img.max_address(), 0x0800_0011);
        assert_eq!(img.len(), 6);
        assert_eq!(img.get(0x0800_0003), Some(0x04));
        assert_eq!(img.get(0x0800_0010), Some(0xAA));
    }

    #[test]
    fn ihex_with_bad_checksum_is_rejected() {
        let text = ":0400000001020304F3\n:00000001FF\n";
        assert!(matches!(FirmwareImage::from_ihex(text), Err(Error::HexFormat(_))));
    }

    #[test]
    fn binary_fills_gaps_with_erased_bytes() {
        let mut img = FirmwareImage::new();
        img.set(0x100, 1);
        img.set(0x103, 4);
        assert_eq!(img.to_binary(), vec![1, 0xFF, 0xFF, 4]);
        assert!(FirmwareImage::new().to_binary().is_empty());
    }
}
