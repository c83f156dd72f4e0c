//! The connection manager (C8): owns the socket, the sequence-number
//! allocator, the device registry, and the two worker threads. `Connection`
//! is a cheap cloneable handle (`Arc<Inner>`) — devices and worker threads
//! each hold their own clone so none of them outlive the shared state by
//! accident.

use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use brokerlink_proto::header::{Header, FUNCTION_ENUMERATE, HEADER_SIZE};
use tracing::{debug, trace, warn};

use crate::{
    dispatch_worker, receive_worker,
    error::{Error, Result},
    queue::{MetaEvent, WorkItem, WorkQueue},
    registry::DeviceRegistry,
    types::{ConnectReason, ConnectionState, DisconnectReason, EnumerateCallback},
};

/// Default response timeout, in milliseconds. Matches the original broker
/// client's default.
pub const DEFAULT_TIMEOUT_MS: u64 = 2500;

type ConnectedCallback = Arc<dyn Fn(ConnectReason) + Send + Sync>;
type DisconnectedCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
type EnumerateCallbackFn = Arc<dyn Fn(EnumerateCallback) + Send + Sync>;

struct DispatchHandle {
    queue: Arc<WorkQueue>,
    thread: JoinHandle<()>,
}

struct ReceiveHandle {
    thread: JoinHandle<()>,
    /// Cleared by `disconnect()` before it shuts the socket down, so the
    /// receive worker can tell a requested shutdown from a real socket error
    /// and skip posting a redundant `DISCONNECTED` meta event.
    flag: Arc<AtomicBool>,
}

struct Inner {
    target: Mutex<Option<(String, u16)>>,
    socket: Mutex<Option<TcpStream>>,
    timeout_ms: AtomicU64,
    auto_reconnect: AtomicBool,
    auto_reconnect_allowed: AtomicBool,
    auto_reconnect_pending: AtomicBool,
    next_sequence_number: Mutex<u8>,
    devices: DeviceRegistry,
    dispatch: Mutex<Option<DispatchHandle>>,
    receive: Mutex<Option<ReceiveHandle>>,
    on_connected: Mutex<Option<ConnectedCallback>>,
    on_disconnected: Mutex<Option<DisconnectedCallback>>,
    on_enumerate: Mutex<Option<EnumerateCallbackFn>>,
}

/// A handle to a broker connection. Cloning shares the same underlying
/// socket, registry and worker threads; it does not open a second
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                target: Mutex::new(None),
                socket: Mutex::new(None),
                timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
                auto_reconnect: AtomicBool::new(true),
                auto_reconnect_allowed: AtomicBool::new(false),
                auto_reconnect_pending: AtomicBool::new(false),
                next_sequence_number: Mutex::new(0),
                devices: DeviceRegistry::new(),
                dispatch: Mutex::new(None),
                receive: Mutex::new(None),
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                on_enumerate: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn registry(&self) -> &DeviceRegistry {
        &self.inner.devices
    }

    /// Allocates the next sequence number, cycling through 1..=15. 0 is
    /// reserved for event frames (see `brokerlink_proto::header::Frame`).
    pub(crate) fn allocate_sequence_number(&self) -> u8 {
        let mut next = self.inner.next_sequence_number.lock().unwrap();
        *next = if *next >= 15 { 1 } else { *next + 1 };
        *next
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.inner.timeout_ms.load(Ordering::Relaxed)
    }

    /// Writes a fully-framed packet to the socket. Held under the socket
    /// lock for the duration of the write so a concurrent `disconnect()`
    /// can't tear the stream down mid-write.
    pub(crate) fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut socket = self.inner.socket.lock().unwrap();
        let Some(stream) = socket.as_mut() else { return Err(Error::NotConnected) };
        stream.write_all(frame).map_err(|err| {
            warn!(%err, "write failed");
            Error::NotConnected
        })
    }

    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_timeout_ms(&self) -> u64 {
        self.timeout_ms()
    }

    pub fn set_auto_reconnect(&self, auto_reconnect: bool) {
        self.inner.auto_reconnect.store(auto_reconnect, Ordering::Relaxed);
        if !auto_reconnect {
            self.inner.auto_reconnect_allowed.store(false, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn get_auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_connection_state(&self) -> ConnectionState {
        if self.inner.socket.lock().unwrap().is_some() {
            ConnectionState::Connected
        } else if self.inner.auto_reconnect_pending.load(Ordering::Relaxed) {
            ConnectionState::Pending
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn register_connected<F>(&self, f: F)
    where
        F: Fn(ConnectReason) + Send + Sync + 'static,
    {
        *self.inner.on_connected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn register_disconnected<F>(&self, f: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        *self.inner.on_disconnected.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn register_enumerate<F>(&self, f: F)
    where
        F: Fn(EnumerateCallback) + Send + Sync + 'static,
    {
        *self.inner.on_enumerate.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn connected_callback(&self) -> Option<ConnectedCallback> {
        self.inner.on_connected.lock().unwrap().clone()
    }

    pub(crate) fn disconnected_callback(&self) -> Option<DisconnectedCallback> {
        self.inner.on_disconnected.lock().unwrap().clone()
    }

    pub(crate) fn enumerate_callback(&self) -> Option<EnumerateCallbackFn> {
        self.inner.on_enumerate.lock().unwrap().clone()
    }

    pub(crate) fn dispatch_queue(&self) -> Option<Arc<WorkQueue>> {
        self.inner.dispatch.lock().unwrap().as_ref().map(|d| d.queue.clone())
    }

    pub(crate) fn auto_reconnect_allowed(&self) -> bool {
        self.inner.auto_reconnect_allowed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_auto_reconnect_allowed(&self, allowed: bool) {
        self.inner.auto_reconnect_allowed.store(allowed, Ordering::Relaxed);
    }

    pub(crate) fn auto_reconnect_pending(&self) -> bool {
        self.inner.auto_reconnect_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_auto_reconnect_pending(&self, pending: bool) {
        self.inner.auto_reconnect_pending.store(pending, Ordering::Relaxed);
    }

    /// Closes and clears the socket and receive-worker handle after the
    /// receive worker has already exited on its own (broker closed the
    /// connection, or a socket error). Called only from the dispatch
    /// worker's `DISCONNECTED` handling — the receive worker itself never
    /// touches `socket_lock`, and this never joins the receive thread while
    /// holding it, so it can't race `disconnect()`'s own teardown.
    pub(crate) fn teardown_after_receive_exit(&self) {
        let mut socket = self.inner.socket.lock().unwrap();
        if let Some(stream) = socket.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        drop(socket);

        let receive = self.inner.receive.lock().unwrap().take();
        if let Some(receive) = receive {
            if !is_current_thread(&receive.thread) {
                let _ = receive.thread.join();
            }
        }
    }

    pub(crate) fn target(&self) -> Option<(String, u16)> {
        self.inner.target.lock().unwrap().clone()
    }

    /// Opens a connection to `host:port`. Fails with [`Error::AlreadyConnected`]
    /// if a socket is already open.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let mut socket = self.inner.socket.lock().unwrap();
        if socket.is_some() {
            return Err(Error::AlreadyConnected);
        }
        *self.inner.target.lock().unwrap() = Some((host.into(), port));
        self.connect_unlocked(&mut socket, ConnectReason::Request)
    }

    /// The shared implementation behind [`Connection::connect`] and the
    /// dispatch worker's auto-reconnect loop. Caller already holds the
    /// socket lock and has set `target`.
    pub(crate) fn connect_unlocked(
        &self,
        socket: &mut Option<TcpStream>,
        reason: ConnectReason,
    ) -> Result<()> {
        let (host, port) = self.target().ok_or(Error::HostnameInvalid)?;

        let spawned_dispatch = self.ensure_dispatch_worker()?;

        let addrs = (host.as_str(), port).to_socket_addrs().map_err(|_| Error::HostnameInvalid)?;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => trace!(%addr, %err, "connect attempt failed"),
            }
        }
        let Some(stream) = stream else {
            if spawned_dispatch {
                self.teardown_dispatch_worker();
            }
            return Err(Error::NoConnect);
        };
        let _ = stream.set_nodelay(true);

        let flag = Arc::new(AtomicBool::new(true));
        let receive_stream = stream.try_clone().map_err(|_| Error::NoStreamSocket)?;
        let connection = self.clone();
        let receive_flag = flag.clone();
        let thread = match brokerlink_util::spawn_named("brokerlink-recv", move || {
            receive_worker::run(connection, receive_stream, receive_flag);
        }) {
            Ok(thread) => thread,
            Err(_) => {
                if spawned_dispatch {
                    self.teardown_dispatch_worker();
                }
                return Err(Error::NoThread);
            }
        };
        *self.inner.receive.lock().unwrap() = Some(ReceiveHandle { thread, flag });

        *socket = Some(stream);
        self.set_auto_reconnect_allowed(false);
        self.set_auto_reconnect_pending(false);

        if let Some(queue) = self.dispatch_queue() {
            queue.put(WorkItem::Meta(MetaEvent::Connected { reason }));
        }
        debug!(%host, port, "connected");
        Ok(())
    }

    /// Spawns the dispatch worker if one doesn't already exist. Returns
    /// whether this call spawned it, so a later failure in the same
    /// `connect_unlocked` call knows whether to tear it back down.
    fn ensure_dispatch_worker(&self) -> Result<bool> {
        let mut dispatch = self.inner.dispatch.lock().unwrap();
        if dispatch.is_some() {
            return Ok(false);
        }
        let queue = Arc::new(WorkQueue::new());
        let connection = self.clone();
        let worker_queue = queue.clone();
        let thread = brokerlink_util::spawn_named("brokerlink-dispatch", move || {
            dispatch_worker::run(connection, worker_queue);
        })
        .map_err(|_| Error::NoThread)?;
        *dispatch = Some(DispatchHandle { queue, thread });
        Ok(true)
    }

    fn teardown_dispatch_worker(&self) {
        let handle = self.inner.dispatch.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.queue.put(WorkItem::Exit);
            if !is_current_thread(&handle.thread) {
                let _ = handle.thread.join();
            }
        }
    }

    /// Closes the connection. Cancels a pending auto-reconnect in place of
    /// tearing anything down if one is in flight.
    pub fn disconnect(&self) -> Result<()> {
        let mut socket = self.inner.socket.lock().unwrap();
        self.set_auto_reconnect_allowed(false);

        let receive_to_join = if self.auto_reconnect_pending() {
            self.set_auto_reconnect_pending(false);
            None
        } else {
            if socket.is_none() {
                return Err(Error::NotConnected);
            }

            let receive = self.inner.receive.lock().unwrap().take();
            if let Some(receive) = &receive {
                receive.flag.store(false, Ordering::Relaxed);
            }
            if let Some(stream) = socket.as_ref() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            *socket = None;
            receive
        };

        // Drop socket_lock before joining the receive thread: socket_lock
        // must never be held across a thread join, and the receive worker's
        // own exit path no longer needs it (see `teardown_after_receive_exit`).
        drop(socket);
        if let Some(receive) = receive_to_join {
            if !is_current_thread(&receive.thread) {
                let _ = receive.thread.join();
            }
        }

        let dispatch = self.inner.dispatch.lock().unwrap().take();

        // Outside the socket lock: a callback invoked from the dispatch
        // worker may itself call connect()/disconnect(), which would
        // deadlock if we were still holding it here.
        if let Some(dispatch) = dispatch {
            dispatch.queue.put(WorkItem::Meta(MetaEvent::Disconnected {
                reason: DisconnectReason::Request,
            }));
            dispatch.queue.put(WorkItem::Exit);
            if !is_current_thread(&dispatch.thread) {
                let _ = dispatch.thread.join();
            }
        }

        Ok(())
    }

    /// Attempts one auto-reconnect pass. Called by the dispatch worker's
    /// retry loop; returns `Err` if this attempt failed (the caller decides
    /// whether to retry).
    pub(crate) fn reconnect_once(&self) -> Result<()> {
        let mut socket = self.inner.socket.lock().unwrap();
        if socket.is_some() {
            return Ok(());
        }
        self.connect_unlocked(&mut socket, ConnectReason::AutoReconnect)
    }

    /// Asks the broker to enumerate all attached devices. Replies arrive as
    /// `ENUMERATE_CALLBACK` events through the registered enumerate
    /// callback, not as a direct return value.
    pub fn enumerate(&self) -> Result<()> {
        let socket = self.inner.socket.lock().unwrap();
        if socket.is_none() {
            return Err(Error::NotConnected);
        }
        let sequence_number = self.allocate_sequence_number();
        let header = Header::new(0, HEADER_SIZE as u8, FUNCTION_ENUMERATE, sequence_number, false);
        let mut frame = [0u8; HEADER_SIZE];
        header.write_to(&mut frame);
        drop(socket);
        self.write_frame(&frame)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker must never join itself: this is how a callback invoked from
/// within a worker thread can call `disconnect()`/`connect()` without
/// deadlocking.
fn is_current_thread(handle: &JoinHandle<()>) -> bool {
    std::thread::current().id() == handle.thread().id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_2500ms() {
        let conn = Connection::new();
        assert_eq!(conn.get_timeout_ms(), DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn starts_disconnected() {
        let conn = Connection::new();
        assert_eq!(conn.get_connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn sequence_numbers_cycle_1_to_15() {
        let conn = Connection::new();
        let seen: Vec<u8> = (0..16).map(|_| conn.allocate_sequence_number()).collect();
        assert_eq!(seen[0], 1);
        assert_eq!(seen[14], 15);
        assert_eq!(seen[15], 1);
    }

    #[test]
    fn disconnect_without_connect_is_not_connected() {
        let conn = Connection::new();
        assert_eq!(conn.disconnect(), Err(Error::NotConnected));
    }

    #[test]
    fn connect_requires_a_hostname() {
        let conn = Connection::new();
        assert!(conn.get_connection_state() == ConnectionState::Disconnected);
    }
}
