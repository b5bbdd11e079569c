//! Firmware update for nRF51 targets running the SDK 8.0 legacy BLE DFU
//! bootloader.
//!
//! - **Opcode / notification**: control point encoding and decoding
//! - **Image**: `.bin` and Intel HEX loading, init packet (`.dat`) handling
//! - **Package**: distribution archive unpacking and input resolution
//! - **Transport**: BLE port abstraction, `btleplug` backend
//! - **Protocol**: the DFU session state machine

pub mod cancel;
pub mod error;
pub mod image;
pub mod init_packet;
pub mod notification;
pub mod opcode;
pub mod package;
pub mod protocol;
pub mod transport;
pub mod transport_btleplug;

#[cfg(test)]
mod transport_mock;

pub use cancel::CancelToken;
pub use error::{DfuError, SessionError, TransportError};
pub use image::{FirmwareImage, InitDescriptor};
pub use package::{UpdateBundle, UpdateSource};
pub use protocol::{dfu_run, DfuConfig, DfuSession, SessionState};
pub use transport::{DfuCharacteristic, DfuTransport};
