//! Minimal legacy init packet (`.dat`) generation.
//!
//! Layout (little-endian): device type, device revision, application
//! version, softdevice count, softdevice ids, CRC-16 of the image.

use crc::{Crc, CRC_16_IBM_3740};

use crate::error::{DfuError, Result};
use crate::image::{FirmwareImage, InitDescriptor};

/// CRC-16/CCITT with 0xFFFF seed, as computed by the bootloader.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// SoftDevice 7.1 and 8.0
const DEFAULT_SOFTDEVICES: [u16; 2] = [0x005a, 0x0064];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPacket {
    pub device_type: u16,
    pub device_rev: u16,
    pub app_version: u32,
    pub softdevices: Vec<u16>,
    pub crc: u16,
}

impl InitPacket {
    /// Init packet accepting any device and application version.
    pub fn for_image(image: &FirmwareImage) -> Result<Self> {
        if image.is_empty() {
            return Err(DfuError::InvalidInput("cannot generate init packet for an empty image".into()));
        }
        Ok(Self {
            device_type: 0xffff,
            device_rev: 0xffff,
            app_version: 0xffff_ffff,
            softdevices: DEFAULT_SOFTDEVICES.to_vec(),
            crc: CRC16.checksum(image.as_bytes()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.softdevices.len()).map_err(|_| DfuError::Encoding {
            field: "softdevice count",
            value: self.softdevices.len() as u64,
            width: 2,
        })?;
        let mut out = Vec::with_capacity(12 + 2 * self.softdevices.len());
        out.extend_from_slice(&self.device_type.to_le_bytes());
        out.extend_from_slice(&self.device_rev.to_le_bytes());
        out.extend_from_slice(&self.app_version.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        for sd in &self.softdevices {
            out.extend_from_slice(&sd.to_le_bytes());
        }
        out.extend_from_slice(&self.crc.to_le_bytes());
        Ok(out)
    }

    pub fn to_descriptor(&self) -> Result<InitDescriptor> {
        Ok(InitDescriptor::from_bytes(self.to_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_matches_bootloader() {
        let image = FirmwareImage::from_bytes(b"123456789".to_vec());
        assert_eq!(InitPacket::for_image(&image).unwrap().crc, 0x29b1);
    }

    #[test]
    fn test_layout() {
        let image = FirmwareImage::from_bytes(b"123456789".to_vec());
        let bytes = InitPacket::for_image(&image).unwrap().to_bytes().unwrap();
        assert_eq!(
            bytes,
            [
                0xff, 0xff, // device type
                0xff, 0xff, // device rev
                0xff, 0xff, 0xff, 0xff, // app version
                0x02, 0x00, // softdevice count
                0x5a, 0x00, 0x64, 0x00, // softdevices
                0xb1, 0x29, // crc
            ]
        );
    }

    #[test]
    fn test_empty_image_rejected() {
        let image = FirmwareImage::from_bytes(Vec::new());
        assert!(matches!(InitPacket::for_image(&image), Err(DfuError::InvalidInput(_))));
    }
}
