//! Mock DFU transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::transport::{DfuCharacteristic, DfuTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(String),
    WriteRequest(DfuCharacteristic, Vec<u8>),
    WriteCommand(DfuCharacteristic, Vec<u8>),
    AwaitNotification,
    Disconnect,
}

pub struct MockLink;

/// Records every call and replays queued notifications.
/// An empty queue behaves like a notification timeout.
#[derive(Default)]
pub struct MockTransport {
    events: Mutex<Vec<Event>>,
    notifications: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
    link_down: AtomicBool,
    stall: AtomicBool,
    cancel_at: Mutex<Option<(usize, CancelToken)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_notification(&self, bytes: &[u8]) {
        self.notifications.lock().unwrap().push_back(Ok(bytes.to_vec()));
    }

    pub fn queue_error(&self, err: TransportError) {
        self.notifications.lock().unwrap().push_back(Err(err));
    }

    /// Once the queue is drained, block in `await_notification` instead of timing out.
    pub fn stall_when_empty(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    /// Cancel `token` once the `n`-th data chunk has been written.
    pub fn cancel_after_data_writes(&self, n: usize, token: CancelToken) {
        *self.cancel_at.lock().unwrap() = Some((n, token));
    }

    pub fn drop_link(&self) {
        self.link_down.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn data_commands(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::WriteCommand(DfuCharacteristic::Data, bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn requests(&self, chr: DfuCharacteristic) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::WriteRequest(c, bytes) if c == chr => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn await_count(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::AwaitNotification).count()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.link_down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkLost);
        }
        Ok(())
    }
}

#[async_trait]
impl DfuTransport for MockTransport {
    type Connection = MockLink;

    async fn connect(&self, target: &str) -> Result<MockLink, TransportError> {
        self.record(Event::Connect(target.to_string()));
        Ok(MockLink)
    }

    async fn write_request(&self, _conn: &MockLink, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_link()?;
        self.record(Event::WriteRequest(chr, bytes.to_vec()));
        Ok(())
    }

    async fn write_command(&self, _conn: &MockLink, chr: DfuCharacteristic, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_link()?;
        self.record(Event::WriteCommand(chr, bytes.to_vec()));
        if let Some((n, token)) = &*self.cancel_at.lock().unwrap() {
            if self.data_commands().len() == *n {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn await_notification(&self, _conn: &MockLink, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.record(Event::AwaitNotification);
        let next = self.notifications.lock().unwrap().pop_front();
        match next {
            Some(Err(TransportError::LinkLost)) => {
                self.link_down.store(true, Ordering::SeqCst);
                Err(TransportError::LinkLost)
            }
            Some(r) => r,
            None if self.stall.load(Ordering::SeqCst) => futures::future::pending().await,
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn is_alive(&self, _conn: &MockLink) -> bool {
        !self.link_down.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, _conn: MockLink) -> Result<(), TransportError> {
        self.record(Event::Disconnect);
        Ok(())
    }
}
