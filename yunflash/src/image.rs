//! Firmware image metadata.
//!
//! The updater stages two images inside the TFTP root directory: the
//! boot-loader image and the main (sysupgrade) image. The device fetches them
//! by bare file name, so all that is carried around is the name and the byte
//! count. The byte count is load-bearing twice: the orchestrator compares it
//! against the `Bytes transferred = N` acknowledgment after every TFTP
//! transfer, and the main image's count sizes the flash erase region.

use crate::error::{Error, Result};
use log::debug;
use std::fs;
use std::path::Path;

/// Default boot-loader image file name.
pub const DEFAULT_BOOTLOADER_IMAGE: &str = "u-boot-arduino-lede.bin";

/// Default sysupgrade image file name.
pub const DEFAULT_SYSUPGRADE_IMAGE: &str =
    "ledeyun-17.11-r5403+1-3e7b776-ar71xx-generic-arduino-yun-squashfs-sysupgrade.bin";

/// A firmware image staged for transfer, identified by the file name the
/// device will request over TFTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Bare file name, as requested by the device.
    pub name: String,
    /// Size of the image file in bytes.
    pub size_bytes: u64,
}

impl FirmwareImage {
    /// Load image metadata for `name` inside the TFTP root directory.
    ///
    /// Fails when the file is missing or not a regular file; both are
    /// configuration errors that must surface before any device interaction.
    pub fn from_dir<P: AsRef<Path>>(root: P, name: &str) -> Result<Self> {
        let path = root.as_ref().join(name);
        let metadata = fs::metadata(&path).map_err(|e| {
            Error::Config(format!("firmware image {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(Error::Config(format!(
                "firmware image {} is not a regular file",
                path.display()
            )));
        }
        debug!("firmware image {} is {} bytes", name, metadata.len());
        Ok(Self {
            name: name.to_string(),
            size_bytes: metadata.len(),
        })
    }

    /// The image size formatted as the boot-loader's hexadecimal erase-length
    /// argument (no `0x` prefix).
    pub fn size_hex(&self) -> String {
        format!("{:x}", self.size_bytes)
    }
}
