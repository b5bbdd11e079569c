use std::future::Future;
use std::time::Duration;

use indicatif::ProgressBar;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::{DfuError, SessionError, TransportError};
use crate::image::{FirmwareImage, InitDescriptor};
use crate::notification::{self, Notification};
use crate::opcode::{self, ImageType, InitPhase, Opcode};
use crate::transport::{DfuCharacteristic, DfuTransport};

// As used by the nRF51 SDK 8.0 legacy bootloader (`dfu_transport_ble.c`)

/// Largest payload of a single write without an MTU exchange
pub const DEFAULT_PAYLOAD_SIZE: usize = 20;
pub const DEFAULT_RECEIPT_INTERVAL: u16 = 10;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Connected,
    NotifyEnabled,
    Started,
    InitSent,
    Receiving,
    Validated,
    Activated,
    Failed,
}

impl SessionState {
    /// Protocol phase entered from this state, for error reporting.
    pub fn phase(&self) -> &'static str {
        match self {
            SessionState::Idle => "connect",
            SessionState::Connected => "notification setup",
            SessionState::NotifyEnabled => "start",
            SessionState::Started => "init packet transfer",
            SessionState::InitSent => "receive setup",
            SessionState::Receiving => "image transfer",
            SessionState::Validated => "activation",
            SessionState::Activated => "reset",
            SessionState::Failed => "a failed session",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DfuConfig {
    /// Bytes per data write
    pub payload_size: usize,
    /// Chunks between packet receipt notifications
    pub receipt_interval: u16,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub notify_timeout: Duration,
    /// Time the target needs after validation before it can be activated
    pub settle_delay: Duration,
    /// Send SYSTEM_RESET after a failure, before disconnecting
    pub reset_on_error: bool,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            payload_size: DEFAULT_PAYLOAD_SIZE,
            receipt_interval: DEFAULT_RECEIPT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(1),
            reset_on_error: false,
        }
    }
}

impl DfuConfig {
    pub fn validate(&self) -> Result<(), DfuError> {
        if self.payload_size == 0 {
            return Err(DfuError::InvalidInput("payload size must be non-zero".into()));
        }
        if self.receipt_interval == 0 {
            return Err(DfuError::InvalidInput("receipt interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Whether the `count`-th chunk (1-based) is followed by a packet receipt.
pub fn awaits_receipt(count: usize, interval: u16) -> bool {
    interval != 0 && count % interval as usize == 0
}

/// Splits an image into the writes sent on the data characteristic.
pub fn image_chunks(image: &[u8], payload_size: usize) -> std::slice::Chunks<'_, u8> {
    image.chunks(payload_size)
}

/// One firmware update against one peripheral.
///
/// Operations must be called in protocol order. A failed operation moves
/// the session to [`SessionState::Failed`], after which it cannot be reused.
pub struct DfuSession<'a, T: DfuTransport> {
    transport: &'a T,
    config: DfuConfig,
    conn: Option<T::Connection>,
    state: SessionState,
    last_opcode: Option<Opcode>,
    receipt_interval: u16,
    cancel: CancelToken,
    bar: ProgressBar,
}

impl<'a, T: DfuTransport> DfuSession<'a, T> {
    pub fn new(transport: &'a T, config: DfuConfig) -> Result<Self, DfuError> {
        config.validate()?;
        Ok(Self {
            transport,
            receipt_interval: config.receipt_interval,
            config,
            conn: None,
            state: SessionState::Idle,
            last_opcode: None,
            cancel: CancelToken::new(),
            bar: ProgressBar::hidden(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_opcode(&self) -> Option<Opcode> {
        self.last_opcode
    }

    /// Run the complete update: connect, transfer, activate, disconnect.
    pub async fn run(
        &mut self,
        address: &str,
        image: &FirmwareImage,
        descriptor: &InitDescriptor,
    ) -> Result<(), SessionError> {
        let result = self.run_steps(address, image, descriptor).await;
        match &result {
            Ok(()) => {
                // the target resets and drops the link on its own
                self.sleep(self.config.settle_delay).await.ok();
            }
            Err(e) => {
                warn!("{}", e);
                if self.config.reset_on_error && self.conn.is_some() {
                    if let Err(e) = self.system_reset().await {
                        debug!("System reset after failure: {}", e);
                    }
                }
            }
        }
        self.disconnect().await;
        result
    }

    async fn run_steps(
        &mut self,
        address: &str,
        image: &FirmwareImage,
        descriptor: &InitDescriptor,
    ) -> Result<(), SessionError> {
        self.begin(address).await?;
        self.enable_notify().await?;
        self.start(ImageType::Application, image).await?;
        self.init_send(descriptor).await?;
        self.configure_receipt_interval(self.config.receipt_interval).await?;
        self.begin_receive().await?;
        self.send_image(image).await?;
        self.activate().await
    }

    pub async fn begin(&mut self, address: &str) -> Result<(), SessionError> {
        self.expect(SessionState::Idle, "connect")?;
        info!(address, "Connecting");
        let limit = self.config.connect_timeout;
        let result = self.guard("connection", limit, self.transport.connect(address)).await;
        match result {
            Ok(conn) => {
                self.conn = Some(conn);
                self.advance(Ok(()), SessionState::Connected)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn enable_notify(&mut self) -> Result<(), SessionError> {
        self.expect(SessionState::Connected, "enable notifications")?;
        let result = self
            .write_request(DfuCharacteristic::ControlPointCccd, &opcode::encode_cccd_enable())
            .await;
        self.advance(result, SessionState::NotifyEnabled)
    }

    /// START_DFU followed by the image size on the data characteristic.
    ///
    /// The size packet only carries an application size, so other modes are
    /// refused before anything is written.
    pub async fn start(&mut self, mode: ImageType, image: &FirmwareImage) -> Result<(), SessionError> {
        self.expect(SessionState::NotifyEnabled, "start")?;
        let result = async {
            if mode != ImageType::Application {
                return Err(DfuError::InvalidInput(format!("{:?} updates are not supported", mode)));
            }
            let size = opcode::encode_image_size_payload(image.len())?;
            self.control(Opcode::StartDfu, &opcode::encode_start_dfu(mode)).await?;
            info!(size = image.len(), "Sending image size");
            self.write_request(DfuCharacteristic::Data, &size).await
        }
        .await;
        self.advance(result, SessionState::Started)
    }

    /// INITIALIZE_DFU, wait for the target to accept it, then send the init packet.
    pub async fn init_send(&mut self, descriptor: &InitDescriptor) -> Result<(), SessionError> {
        self.expect(SessionState::Started, "init")?;
        let result = async {
            self.control(Opcode::InitializeDfu, &opcode::encode_init_dfu(InitPhase::Receive))
                .await?;
            // answered once the target has erased its bank
            match self.wait_notification("init response").await? {
                Notification::Response { procedure, status } => {
                    debug!(?procedure, ?status, "Init response");
                    Notification::Response { procedure, status }.ensure_success()?;
                }
                Notification::PacketReceipt { count } => {
                    let mut bytes = vec![notification::OP_PKT_RCPT_NOTIF];
                    bytes.extend_from_slice(&count.to_le_bytes());
                    return Err(DfuError::malformed(&bytes, "expected a response"));
                }
            }
            info!(size = descriptor.as_bytes().len(), "Sending init packet");
            self.write_request(DfuCharacteristic::Data, descriptor.as_bytes()).await?;
            self.control(Opcode::InitializeDfu, &opcode::encode_init_dfu(InitPhase::Complete))
                .await
        }
        .await;
        self.advance(result, SessionState::InitSent)
    }

    pub async fn configure_receipt_interval(&mut self, interval: u16) -> Result<(), SessionError> {
        self.expect(SessionState::InitSent, "configure receipt interval")?;
        if interval == 0 {
            let e = DfuError::InvalidInput("receipt interval must be non-zero".into());
            return Err(self.fail(e));
        }
        let result = self
            .control(Opcode::PktRcptNotifReq, &opcode::encode_pkt_rcpt_notif_req(interval))
            .await;
        if result.is_ok() {
            self.receipt_interval = interval;
        }
        self.advance(result, SessionState::InitSent)
    }

    pub async fn begin_receive(&mut self) -> Result<(), SessionError> {
        self.expect(SessionState::InitSent, "receive")?;
        let result = self
            .control(
                Opcode::ReceiveFirmwareImage,
                &opcode::encode_single_byte_command(Opcode::ReceiveFirmwareImage),
            )
            .await;
        self.advance(result, SessionState::Receiving)
    }

    /// Stream the image and request validation.
    ///
    /// Every `receipt_interval` chunks the transfer blocks on one packet
    /// receipt. A missing or failed receipt aborts the session; nothing is
    /// retransmitted.
    pub async fn send_image(&mut self, image: &FirmwareImage) -> Result<(), SessionError> {
        self.expect(SessionState::Receiving, "image transfer")?;
        let result = async {
            self.transfer(image).await?;
            self.control(
                Opcode::ValidateFirmwareImage,
                &opcode::encode_single_byte_command(Opcode::ValidateFirmwareImage),
            )
            .await
        }
        .await;
        self.advance(result, SessionState::Validated)
    }

    pub async fn activate(&mut self) -> Result<(), SessionError> {
        self.expect(SessionState::Validated, "activate")?;
        let result = async {
            // wait for the copy on the target to finish
            self.sleep(self.config.settle_delay).await?;
            self.control(
                Opcode::ActivateFirmwareAndReset,
                &opcode::encode_single_byte_command(Opcode::ActivateFirmwareAndReset),
            )
            .await
        }
        .await;
        let result = self.advance(result, SessionState::Activated);
        if result.is_ok() {
            info!("Firmware activated");
        }
        result
    }

    /// Ask the target to reset without activating, whatever the protocol state.
    pub async fn system_reset(&mut self) -> Result<(), DfuError> {
        self.control(Opcode::SystemReset, &opcode::encode_single_byte_command(Opcode::SystemReset))
            .await
    }

    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.transport.disconnect(conn).await {
                debug!("Disconnect: {}", e);
            }
        }
    }

    async fn transfer(&mut self, image: &FirmwareImage) -> Result<(), DfuError> {
        let interval = self.receipt_interval;
        self.bar.set_length(image.len() as u64);
        info!(size = image.len(), "Started DFU upload");

        let mut offset = 0;
        for (index, chunk) in image_chunks(image.as_bytes(), self.config.payload_size).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(DfuError::TransferAborted);
            }
            self.write_command(DfuCharacteristic::Data, chunk).await?;
            offset += chunk.len();
            self.bar.set_position(offset as u64);

            let count = index + 1;
            if awaits_receipt(count, interval) {
                match self.wait_notification("packet receipt").await?.ensure_success()? {
                    Notification::PacketReceipt { count: received } => {
                        debug!(chunk = count, received, "Packet receipt");
                    }
                    Notification::Response { procedure, .. } => {
                        debug!(chunk = count, ?procedure, "Response in place of packet receipt");
                    }
                }
            }
        }
        self.bar.finish();
        info!(size = image.len(), "Finished DFU upload");
        Ok(())
    }

    async fn control(&mut self, opcode: Opcode, bytes: &[u8]) -> Result<(), DfuError> {
        self.last_opcode = Some(opcode);
        debug!(?opcode, "Control point request");
        self.write_request(DfuCharacteristic::ControlPoint, bytes).await
    }

    async fn write_request(&self, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), DfuError> {
        let conn = self.conn()?;
        let limit = self.config.write_timeout;
        self.guard("write response", limit, self.transport.write_request(conn, chr, bytes))
            .await
    }

    async fn write_command(&self, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), DfuError> {
        let conn = self.conn()?;
        let limit = self.config.write_timeout;
        self.guard("write", limit, self.transport.write_command(conn, chr, bytes))
            .await
    }

    async fn wait_notification(&self, what: &str) -> Result<Notification, DfuError> {
        let conn = self.conn()?;
        if !self.transport.is_alive(conn).await {
            return Err(DfuError::LinkLost);
        }
        let limit = self.config.notify_timeout;
        let bytes = self
            .guard(what, limit, self.transport.await_notification(conn, limit))
            .await?;
        debug!("Notification {:02x?}", bytes);
        notification::parse(&bytes)
    }

    /// Bounds a transport call by `limit` and aborts it on cancellation.
    async fn guard<R, F>(&self, what: &str, limit: Duration, future: F) -> Result<R, DfuError>
    where
        F: Future<Output = Result<R, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DfuError::TransferAborted),
            result = tokio::time::timeout(limit, future) => match result {
                Ok(r) => r.map_err(DfuError::from),
                Err(_) => Err(DfuError::Timeout(what.to_string())),
            },
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), DfuError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DfuError::TransferAborted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn conn(&self) -> Result<&T::Connection, DfuError> {
        self.conn.as_ref().ok_or(DfuError::LinkLost)
    }

    fn expect(&self, state: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == state {
            return Ok(());
        }
        Err(SessionError {
            kind: DfuError::OutOfSequence {
                operation,
                state: self.state,
            },
            state: self.state,
            last_opcode: self.last_opcode,
        })
    }

    fn advance(&mut self, result: Result<(), DfuError>, next: SessionState) -> Result<(), SessionError> {
        match result {
            Ok(()) => {
                if next != self.state {
                    debug!(from = ?self.state, to = ?next, "State change");
                }
                self.state = next;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, kind: DfuError) -> SessionError {
        let state = self.state;
        self.state = SessionState::Failed;
        self.bar.abandon();
        SessionError {
            kind,
            state,
            last_opcode: self.last_opcode,
        }
    }
}

/// Run DFU procedure of the nRF51 SDK 8.0 legacy BLE bootloader
#[instrument(skip(transport, image, descriptor, config, cancel, bar), fields(size = image.len()))]
pub async fn dfu_run<T: DfuTransport>(
    transport: &T,
    address: &str,
    image: &FirmwareImage,
    descriptor: &InitDescriptor,
    config: DfuConfig,
    cancel: CancelToken,
    bar: ProgressBar,
) -> Result<(), SessionError> {
    let session = DfuSession::new(transport, config).map_err(|kind| SessionError {
        kind,
        state: SessionState::Idle,
        last_opcode: None,
    })?;
    let mut session = session.with_cancel(cancel).with_progress(bar);
    session.run(address, image, descriptor).await
}
