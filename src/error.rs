use std::fmt;

use thiserror::Error;

use crate::notification::{Procedure, Status};
use crate::opcode::Opcode;
use crate::protocol::SessionState;

/// Errors reported by a [`DfuTransport`](crate::transport::DfuTransport) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("link lost")]
    LinkLost,

    #[error("not connected")]
    NotConnected,
}

/// DFU error kinds
#[derive(Error, Debug)]
pub enum DfuError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed notification {bytes:02x?}: {reason}")]
    MalformedNotification { bytes: Vec<u8>, reason: &'static str },

    #[error("{procedure:?} rejected by target with {status:?} (0x{:02x})", status_code(.status))]
    ProtocolRejected { procedure: Procedure, status: Status },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("link lost")]
    LinkLost,

    #[error("transfer aborted")]
    TransferAborted,

    #[error("cannot encode {field}: {value} does not fit in {width} bytes")]
    Encoding {
        field: &'static str,
        value: u64,
        width: usize,
    },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("{operation} is not valid in state {state:?}")]
    OutOfSequence {
        operation: &'static str,
        state: SessionState,
    },
}

fn status_code(status: &Status) -> u8 {
    (*status).into()
}

impl DfuError {
    pub(crate) fn malformed(bytes: &[u8], reason: &'static str) -> Self {
        DfuError::MalformedNotification {
            bytes: bytes.to_vec(),
            reason,
        }
    }
}

impl From<TransportError> for DfuError {
    fn from(e: TransportError) -> Self {
        match e {
            // an unacknowledged write is indistinguishable from a lost response
            TransportError::Write(msg) => DfuError::Timeout(format!("write acknowledgement ({msg})")),
            TransportError::Timeout { timeout_ms } => DfuError::Timeout(format!("transport ({timeout_ms}ms)")),
            TransportError::LinkLost | TransportError::NotConnected => DfuError::LinkLost,
            TransportError::Connect(msg) => DfuError::ConnectFailed(msg),
        }
    }
}

impl From<std::io::Error> for DfuError {
    fn from(e: std::io::Error) -> Self {
        DfuError::InvalidInput(e.to_string())
    }
}

/// Terminal failure of a DFU session: the error kind together with the
/// state it occurred in and the last opcode written to the control point.
#[derive(Debug)]
pub struct SessionError {
    pub kind: DfuError,
    pub state: SessionState,
    pub last_opcode: Option<Opcode>,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DFU failed during {}", self.state.phase())?;
        if let Some(op) = self.last_opcode {
            write!(f, " (last opcode {:?})", op)?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

pub type Result<T, E = DfuError> = std::result::Result<T, E>;
