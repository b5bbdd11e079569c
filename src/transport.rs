use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Legacy nRF DFU service & characteristic UUIDs
///
/// from the nRF51 SDK 8.0 `ble_dfu` service, which predates the secure
/// bootloader's 0xFE59 service.
#[allow(dead_code)]
pub mod dfu_uuids {
    /// DFU Service
    pub const SERVICE: uuid::Uuid = uuid::Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCDE23);
    /// Control Point Characteristic
    pub const CTRL_PT: uuid::Uuid = uuid::Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCDE23);
    /// Packet (data) Characteristic
    pub const DATA_PT: uuid::Uuid = uuid::Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCDE23);
    /// DFU Revision Characteristic
    pub const REVISION: uuid::Uuid = uuid::Uuid::from_u128(0x00001534_1212_EFDE_1523_785FEABCDE23);
}

/// Attributes written by the DFU protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DfuCharacteristic {
    ControlPoint,
    /// Client configuration descriptor of the control point
    ControlPointCccd,
    Data,
}

/// nRF DFU transport interface
#[async_trait]
pub trait DfuTransport: Send + Sync {
    /// Link to one peripheral, owned by a single session
    type Connection: Send + Sync;

    /// Connect to the peripheral at `target`
    async fn connect(&self, target: &str) -> Result<Self::Connection, TransportError>;
    /// Write and wait for the write response
    async fn write_request(
        &self,
        conn: &Self::Connection,
        chr: DfuCharacteristic,
        bytes: &[u8],
    ) -> Result<(), TransportError>;
    /// Write without response
    async fn write_command(
        &self,
        conn: &Self::Connection,
        chr: DfuCharacteristic,
        bytes: &[u8],
    ) -> Result<(), TransportError>;
    /// Next control point notification
    async fn await_notification(&self, conn: &Self::Connection, timeout: Duration) -> Result<Vec<u8>, TransportError>;
    async fn is_alive(&self, conn: &Self::Connection) -> bool;
    async fn disconnect(&self, conn: Self::Connection) -> Result<(), TransportError>;
}
