//! Per-device state (C9): response-expected policy, the one in-flight
//! response slot, and the registered event handler table.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use brokerlink_proto::header::{BrokerError, Header};
use tracing::trace;

use crate::{
    connection::Connection,
    error::{Error, Result},
};

/// Per-(device, function) response-expected policy. `AlwaysFalse`,
/// `AlwaysTrue` and `Invalid` are fixed by whatever registered them (normally
/// generated stub code) and can't be flipped by [`Device::set_response_expected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseExpected {
    Invalid,
    AlwaysFalse,
    AlwaysTrue,
    False,
    True,
}

impl ResponseExpected {
    fn as_bool(self) -> bool {
        matches!(self, ResponseExpected::AlwaysTrue | ResponseExpected::True)
    }

    fn is_mutable(self) -> bool {
        matches!(self, ResponseExpected::False | ResponseExpected::True)
    }
}

#[derive(Default)]
struct ExpectedResponse {
    function_id: u8,
    sequence_number: u8,
}

type Handler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A single attached device. Devices self-register into their connection's
/// registry on construction ([`Device::new`]) and deregister on drop.
pub struct Device {
    id: u32,
    connection: Connection,
    api_version: Mutex<(u8, u8, u8)>,
    response_expected: Mutex<HashMap<u8, ResponseExpected>>,
    request_lock: Mutex<()>,
    expected: Mutex<Option<ExpectedResponse>>,
    response_slot: Mutex<Option<(Header, Vec<u8>)>>,
    response_ready: Condvar,
    /// The generated-stub-code "wrapper" slot and the plain user callback
    /// slot are unified: both are just a boxed closure over the raw event
    /// payload. A stub would register a decoding wrapper here; without stub
    /// generation this is also where a caller's raw handler lives.
    handlers: Mutex<HashMap<u8, Handler>>,
}

impl Device {
    /// Creates a device and registers it with `connection`.
    #[must_use]
    pub fn new(id: u32, connection: &Connection) -> Arc<Self> {
        let device = Arc::new(Self {
            id,
            connection: connection.clone(),
            api_version: Mutex::new((0, 0, 0)),
            response_expected: Mutex::new(HashMap::new()),
            request_lock: Mutex::new(()),
            expected: Mutex::new(None),
            response_slot: Mutex::new(None),
            response_ready: Condvar::new(),
            handlers: Mutex::new(HashMap::new()),
        });
        connection.registry().insert(&device);
        device
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn api_version(&self) -> (u8, u8, u8) {
        *self.api_version.lock().unwrap()
    }

    /// Set by stub code after querying the device's API version.
    pub fn set_api_version(&self, version: (u8, u8, u8)) {
        *self.api_version.lock().unwrap() = version;
    }

    /// Registers (or replaces) the handler invoked for events on
    /// `function_id`. Called with the event's raw payload (header stripped).
    pub fn register_handler<F>(&self, function_id: u8, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().insert(function_id, Arc::new(handler));
    }

    pub(crate) fn handler_for(&self, function_id: u8) -> Option<Handler> {
        self.handlers.lock().unwrap().get(&function_id).cloned()
    }

    fn policy_for(&self, function_id: u8) -> ResponseExpected {
        *self.response_expected.lock().unwrap().get(&function_id).unwrap_or(&ResponseExpected::False)
    }

    #[must_use]
    pub fn response_expected(&self, function_id: u8) -> bool {
        self.policy_for(function_id).as_bool()
    }

    /// Flips a mutable (`False`/`True`) entry. No-op (documented, not an
    /// error) on `Invalid`/`AlwaysFalse`/`AlwaysTrue` entries.
    pub fn set_response_expected(&self, function_id: u8, flag: bool) {
        let mut table = self.response_expected.lock().unwrap();
        let entry = table.entry(function_id).or_insert(ResponseExpected::False);
        if entry.is_mutable() {
            *entry = if flag { ResponseExpected::True } else { ResponseExpected::False };
        }
    }

    /// Same as [`Device::set_response_expected`] but applied to every
    /// currently-mutable entry.
    pub fn set_response_expected_all(&self, flag: bool) {
        let mut table = self.response_expected.lock().unwrap();
        for entry in table.values_mut() {
            if entry.is_mutable() {
                *entry = if flag { ResponseExpected::True } else { ResponseExpected::False };
            }
        }
    }

    /// Fixes a function id's policy to `Invalid`/`AlwaysFalse`/`AlwaysTrue`,
    /// making it immune to later [`Device::set_response_expected`] calls.
    /// This is the hook generated stub code uses; nothing in this crate
    /// calls it on the caller's behalf.
    pub fn lock_response_expected(&self, function_id: u8, policy: ResponseExpected) {
        self.response_expected.lock().unwrap().insert(function_id, policy);
    }

    /// Sends a request and, if the function's policy calls for it, waits for
    /// the matching response. Serializes per-device: only one request may be
    /// in flight on a given device at a time.
    pub fn send_request(&self, function_id: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let _guard: MutexGuard<'_, ()> = self.request_lock.lock().unwrap();

        let response_expected = self.response_expected(function_id);
        let sequence_number = self.connection.allocate_sequence_number();
        let length = (brokerlink_proto::header::HEADER_SIZE + payload.len()) as u8;
        let header = Header::new(self.id, length, function_id, sequence_number, response_expected);

        let mut frame = vec![0u8; length as usize];
        header.write_to(&mut frame);
        frame[brokerlink_proto::header::HEADER_SIZE..].copy_from_slice(payload);

        if response_expected {
            *self.expected.lock().unwrap() =
                Some(ExpectedResponse { function_id, sequence_number });
            *self.response_slot.lock().unwrap() = None;
        }

        let write_result = self.connection.write_frame(&frame);
        if let Err(err) = write_result {
            *self.expected.lock().unwrap() = None;
            return Err(err);
        }

        if !response_expected {
            return Ok(Vec::new());
        }

        let timeout = Duration::from_millis(self.connection.timeout_ms());
        let result = self.wait_for_response(timeout);
        *self.expected.lock().unwrap() = None;
        *self.response_slot.lock().unwrap() = None;
        result
    }

    fn wait_for_response(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.response_slot.lock().unwrap();
        loop {
            if let Some((header, payload)) = slot.take() {
                return match Error::from_broker_error(header.broker_error()) {
                    Some(err) => Err(err),
                    None => Ok(payload),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (guard, timeout_result) =
                self.response_ready.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
            if timeout_result.timed_out() && slot.is_none() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Called by the receive worker when a frame's sequence number and
    /// function id match this device's currently expected response.
    pub(crate) fn try_deliver_response(&self, header: Header, payload: Vec<u8>) -> bool {
        let expected = self.expected.lock().unwrap();
        let Some(expected) = expected.as_ref() else { return false };
        if expected.function_id != header.function_id ||
            expected.sequence_number != header.sequence_number
        {
            return false;
        }
        drop(expected);

        trace!(device_id = self.id, function_id = header.function_id, "response delivered");
        *self.response_slot.lock().unwrap() = Some((header, payload));
        self.response_ready.notify_one();
        true
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.connection.registry().remove(self.id);
    }
}
