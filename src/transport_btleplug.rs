use crate::error::TransportError;
use crate::opcode::encode_cccd_enable;
use crate::transport::dfu_uuids::*;
use crate::transport::{DfuCharacteristic, DfuTransport};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::Adapter;
use btleplug::platform::Peripheral;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn find_characteristic_by_uuid(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic, TransportError> {
    for char in peripheral.characteristics() {
        if uuid == char.uuid {
            return Ok(char);
        }
    }
    Err(TransportError::Connect(format!("characteristic {} not found", uuid)))
}

fn connect_err(e: btleplug::Error) -> TransportError {
    TransportError::Connect(e.to_string())
}

/// Peripheral lookup key: a Bluetooth address or an advertised name.
#[derive(Debug, PartialEq)]
enum Target {
    Addr(BDAddr),
    Name(String),
}

impl Target {
    fn parse(target: &str) -> Self {
        match target.to_uppercase().parse::<BDAddr>() {
            Ok(addr) => Target::Addr(addr),
            Err(_) => Target::Name(target.to_string()),
        }
    }
}

async fn matches(peripheral: &Peripheral, target: &Target) -> Result<bool, btleplug::Error> {
    let props = match peripheral.properties().await? {
        Some(props) => props,
        None => return Ok(false),
    };
    Ok(match target {
        Target::Addr(addr) => props.address == *addr,
        Target::Name(name) => props.local_name.as_deref() == Some(name.as_str()),
    })
}

/// Runs `f` when dropped, unless disarmed first.
struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    fn new(f: F) -> Self {
        OnDrop(Some(f))
    }

    fn disarm(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Stop scanning from a context that cannot await, e.g. a cancelled lookup.
fn spawn_stop_scan(central: Adapter) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = central.stop_scan().await {
                debug!("Stop scan: {}", e);
            }
        });
    }
}

async fn find_peripheral(central: &Adapter, target: &Target) -> Result<Peripheral, btleplug::Error> {
    central.start_scan(ScanFilter::default()).await?;
    // covers errors and the caller's timeout dropping this future
    let scanning = OnDrop::new({
        let central = central.clone();
        move || spawn_stop_scan(central)
    });
    let found = scan_for(central, target).await?;
    scanning.disarm();
    central.stop_scan().await?;
    Ok(found)
}

async fn scan_for(central: &Adapter, target: &Target) -> Result<Peripheral, btleplug::Error> {
    let mut events = central.events().await?;

    // already known to the adapter from an earlier scan
    for peripheral in central.peripherals().await? {
        if matches(&peripheral, target).await? {
            return Ok(peripheral);
        }
    }
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            if matches(&peripheral, target).await? {
                info!("Found target at [{}]", id);
                return Ok(peripheral);
            }
        }
    }
    Err(btleplug::Error::DeviceNotFound)
}

/// Connection to a legacy DFU target
pub struct BleLink {
    peripheral: Peripheral,
    control_point: Characteristic,
    data_point: Characteristic,
    notifications: Mutex<NotificationStream>,
}

impl BleLink {
    fn characteristic(&self, chr: DfuCharacteristic) -> &Characteristic {
        match chr {
            DfuCharacteristic::ControlPoint | DfuCharacteristic::ControlPointCccd => &self.control_point,
            DfuCharacteristic::Data => &self.data_point,
        }
    }
}

pub struct DfuTransportBtleplug {
    central: Adapter,
}

impl DfuTransportBtleplug {
    /// Use the first Bluetooth adapter of the host.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = btleplug::platform::Manager::new().await.map_err(connect_err)?;
        let adapters = manager.adapters().await.map_err(connect_err)?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Connect("no Bluetooth adapter found".into()))?;
        Ok(DfuTransportBtleplug { central })
    }

    async fn write(
        &self,
        conn: &BleLink,
        chr: DfuCharacteristic,
        bytes: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        if chr == DfuCharacteristic::ControlPointCccd {
            // btleplug owns the descriptor write
            let res = if bytes == encode_cccd_enable() {
                conn.peripheral.subscribe(&conn.control_point).await
            } else {
                conn.peripheral.unsubscribe(&conn.control_point).await
            };
            return res.map_err(|e| TransportError::Write(e.to_string()));
        }
        match conn.peripheral.write(conn.characteristic(chr), bytes, write_type).await {
            Ok(()) => Ok(()),
            Err(_) if !self.is_alive(conn).await => Err(TransportError::LinkLost),
            Err(e) => Err(TransportError::Write(e.to_string())),
        }
    }
}

#[async_trait]
impl DfuTransport for DfuTransportBtleplug {
    type Connection = BleLink;

    async fn connect(&self, target: &str) -> Result<BleLink, TransportError> {
        let target = Target::parse(target);
        let peripheral = find_peripheral(&self.central, &target).await.map_err(connect_err)?;
        peripheral.connect().await.map_err(connect_err)?;
        peripheral.discover_services().await.map_err(connect_err)?;

        let control_point = find_characteristic_by_uuid(&peripheral, CTRL_PT)?;
        let data_point = find_characteristic_by_uuid(&peripheral, DATA_PT)?;
        let notifications = peripheral.notifications().await.map_err(connect_err)?;
        debug!("Discovered DFU control point and packet characteristics");
        Ok(BleLink {
            peripheral,
            control_point,
            data_point,
            notifications: Mutex::new(notifications),
        })
    }

    async fn write_request(&self, conn: &BleLink, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), TransportError> {
        self.write(conn, chr, bytes, WriteType::WithResponse).await
    }

    async fn write_command(&self, conn: &BleLink, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), TransportError> {
        self.write(conn, chr, bytes, WriteType::WithoutResponse).await
    }

    async fn await_notification(&self, conn: &BleLink, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut notifications = conn.notifications.lock().await;
        loop {
            match tokio::time::timeout_at(deadline, notifications.next()).await {
                Ok(Some(ntf)) if ntf.uuid == CTRL_PT => return Ok(ntf.value),
                Ok(Some(_)) => continue,
                Ok(None) => return Err(TransportError::LinkLost),
                Err(_) if !self.is_alive(conn).await => return Err(TransportError::LinkLost),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    async fn is_alive(&self, conn: &BleLink) -> bool {
        conn.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self, conn: BleLink) -> Result<(), TransportError> {
        conn.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}
