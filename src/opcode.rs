//! Control point command encoding for the legacy (SDK 8) DFU service.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{DfuError, Result};

/// DFU Command opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    StartDfu = 0x01,
    InitializeDfu = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmwareImage = 0x04,
    ActivateFirmwareAndReset = 0x05,
    SystemReset = 0x06,
    PktRcptNotifReq = 0x08,
}

/// START_DFU sub-mode: which image kinds follow
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

impl Default for ImageType {
    fn default() -> Self {
        ImageType::Application
    }
}

/// INITIALIZE_DFU phase
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum InitPhase {
    Receive = 0x00,
    Complete = 0x01,
}

/// Value written to the control point CCCD to enable notifications.
pub const CCCD_NOTIFY: u16 = 0x0001;

pub fn encode_start_dfu(mode: ImageType) -> [u8; 2] {
    [Opcode::StartDfu.into(), mode.into()]
}

pub fn encode_init_dfu(phase: InitPhase) -> [u8; 2] {
    [Opcode::InitializeDfu.into(), phase.into()]
}

pub fn encode_single_byte_command(opcode: Opcode) -> [u8; 1] {
    [opcode.into()]
}

pub fn encode_pkt_rcpt_notif_req(interval: u16) -> [u8; 3] {
    let [lsb, msb] = interval.to_le_bytes();
    [Opcode::PktRcptNotifReq.into(), lsb, msb]
}

/// Image size packet written to the data characteristic after START_DFU.
///
/// The bootloader expects three little-endian sizes: softdevice, bootloader
/// and application. Only application updates are sent, so the first two
/// are always zero.
pub fn encode_image_size_payload(size: usize) -> Result<[u8; 12]> {
    let size = u32::try_from(size).map_err(|_| DfuError::Encoding {
        field: "image size",
        value: size as u64,
        width: 4,
    })?;
    let mut payload = [0u8; 12];
    payload[8..].copy_from_slice(&size.to_le_bytes());
    Ok(payload)
}

pub fn encode_cccd_enable() -> [u8; 2] {
    CCCD_NOTIFY.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_dfu_application() {
        assert_eq!(encode_start_dfu(ImageType::Application), [0x01, 0x04]);
        assert_eq!(encode_start_dfu(ImageType::SoftDevice), [0x01, 0x01]);
    }

    #[test]
    fn test_init_dfu_phases() {
        assert_eq!(encode_init_dfu(InitPhase::Receive), [0x02, 0x00]);
        assert_eq!(encode_init_dfu(InitPhase::Complete), [0x02, 0x01]);
    }

    #[test]
    fn test_single_byte_commands() {
        assert_eq!(encode_single_byte_command(Opcode::ReceiveFirmwareImage), [0x03]);
        assert_eq!(encode_single_byte_command(Opcode::ValidateFirmwareImage), [0x04]);
        assert_eq!(encode_single_byte_command(Opcode::ActivateFirmwareAndReset), [0x05]);
        assert_eq!(encode_single_byte_command(Opcode::SystemReset), [0x06]);
    }

    #[test]
    fn test_pkt_rcpt_notif_req_is_little_endian() {
        assert_eq!(encode_pkt_rcpt_notif_req(10), [0x08, 0x0a, 0x00]);
        assert_eq!(encode_pkt_rcpt_notif_req(0x1234), [0x08, 0x34, 0x12]);
    }

    #[test]
    fn test_image_size_payload() {
        let payload = encode_image_size_payload(0x0001_2345).unwrap();
        assert_eq!(payload, [0, 0, 0, 0, 0, 0, 0, 0, 0x45, 0x23, 0x01, 0x00]);
        assert_eq!(encode_image_size_payload(0).unwrap(), [0u8; 12]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_image_size_overflow_is_rejected() {
        let err = encode_image_size_payload(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, DfuError::Encoding { width: 4, .. }));
    }

    #[test]
    fn test_cccd_enable() {
        assert_eq!(encode_cccd_enable(), [0x01, 0x00]);
    }

    #[test]
    fn test_opcode_from_byte() {
        assert_eq!(Opcode::try_from(0x08).unwrap(), Opcode::PktRcptNotifReq);
        assert!(Opcode::try_from(0x07).is_err());
    }
}
