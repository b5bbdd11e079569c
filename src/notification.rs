//! Decoding of control point notifications.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{DfuError, Result};

/// Leading byte of a notification that carries a procedure response.
pub const OP_RESPONSE: u8 = 0x10;
/// Leading byte of a packet receipt notification.
pub const OP_PKT_RCPT_NOTIF: u8 = 0x11;

/// Procedure a response refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Procedure {
    Start = 0x01,
    Init = 0x02,
    ReceiveApp = 0x03,
    Validate = 0x04,
    PktRcptReq = 0x08,
}

/// DFU Response status codes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Status {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSize = 0x04,
    CrcError = 0x05,
    OperFailed = 0x06,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Notification {
    Response { procedure: Procedure, status: Status },
    PacketReceipt { count: u32 },
}

impl Notification {
    /// Fails with `ProtocolRejected` for a response whose status is not `Success`.
    pub fn ensure_success(self) -> Result<Self> {
        match self {
            Notification::Response { procedure, status } if status != Status::Success => {
                Err(DfuError::ProtocolRejected { procedure, status })
            }
            ok => Ok(ok),
        }
    }
}

pub fn parse(bytes: &[u8]) -> Result<Notification> {
    if bytes.len() < 3 {
        return Err(DfuError::malformed(bytes, "shorter than 3 bytes"));
    }
    match bytes[0] {
        OP_RESPONSE => {
            let procedure =
                Procedure::try_from(bytes[1]).map_err(|_| DfuError::malformed(bytes, "unknown procedure"))?;
            let status = Status::try_from(bytes[2]).map_err(|_| DfuError::malformed(bytes, "unknown status"))?;
            Ok(Notification::Response { procedure, status })
        }
        OP_PKT_RCPT_NOTIF => {
            if bytes.len() < 5 {
                return Err(DfuError::malformed(bytes, "truncated packet receipt"));
            }
            let count = (bytes[4] as u32) << 24 | (bytes[3] as u32) << 16 | (bytes[2] as u32) << 8 | bytes[1] as u32;
            Ok(Notification::PacketReceipt { count })
        }
        _ => Err(DfuError::malformed(bytes, "unknown operation")),
    }
}
