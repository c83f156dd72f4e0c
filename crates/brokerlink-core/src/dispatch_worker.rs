//! The dispatch worker (C7): the single consumer of the work queue. Invokes
//! lifecycle callbacks, routes events to device handlers, and owns the
//! auto-reconnect retry loop.

use std::{sync::Arc, thread, time::Duration};

use brokerlink_proto::header::{Header, HEADER_SIZE, FUNCTION_ENUMERATE_CALLBACK};
use tracing::{debug, trace, warn};

use crate::{
    connection::Connection,
    queue::{MetaEvent, WorkItem, WorkQueue},
    types::EnumerateCallback,
};

/// Interval between auto-reconnect attempts.
const RECONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn run(connection: Connection, queue: Arc<WorkQueue>) {
    loop {
        match queue.get() {
            WorkItem::Exit => return,
            WorkItem::Meta(MetaEvent::Connected { reason }) => {
                if let Some(cb) = connection.connected_callback() {
                    cb(reason);
                }
            }
            WorkItem::Meta(MetaEvent::Disconnected { reason }) => {
                // A no-op when `disconnect()` already tore the socket down
                // itself; closes and clears it when the receive worker
                // posted this after an unrequested exit.
                connection.teardown_after_receive_exit();

                // Give a just-closed server listener a moment before a
                // reconnect attempt might race it.
                thread::sleep(RECONNECT_RETRY_INTERVAL);
                if let Some(cb) = connection.disconnected_callback() {
                    cb(reason);
                }
                auto_reconnect(&connection);
            }
            WorkItem::Packet(frame) => dispatch_packet(&connection, frame),
        }
    }
}

fn dispatch_packet(connection: &Connection, frame: Vec<u8>) {
    let header = Header::parse(&frame[..HEADER_SIZE]);
    let payload = &frame[HEADER_SIZE..];

    if header.function_id == FUNCTION_ENUMERATE_CALLBACK {
        match EnumerateCallback::decode(payload) {
            Some(enumerate) => {
                if let Some(cb) = connection.enumerate_callback() {
                    cb(enumerate);
                }
            }
            None => warn!("malformed enumerate callback payload"),
        }
        return;
    }

    match connection.registry().find(header.device_id) {
        Some(device) => {
            if let Some(handler) = device.handler_for(header.function_id) {
                handler(payload);
            } else {
                trace!(
                    device_id = header.device_id,
                    function_id = header.function_id,
                    "event with no registered handler"
                );
            }
        }
        None => trace!(device_id = header.device_id, "event for unknown device"),
    }
}

/// Retries [`Connection::reconnect_once`] every [`RECONNECT_RETRY_INTERVAL`]
/// until it succeeds or `disconnect()`/`set_auto_reconnect(false)` clears
/// `auto_reconnect_allowed` out from under us.
fn auto_reconnect(connection: &Connection) {
    if !connection.get_auto_reconnect() || !connection.auto_reconnect_allowed() {
        return;
    }

    connection.set_auto_reconnect_pending(true);
    while connection.auto_reconnect_allowed() {
        thread::sleep(RECONNECT_RETRY_INTERVAL);
        if !connection.auto_reconnect_allowed() {
            break;
        }
        match connection.reconnect_once() {
            Ok(()) => {
                debug!("auto-reconnect succeeded");
                break;
            }
            Err(err) => trace!(%err, "auto-reconnect attempt failed"),
        }
    }
    connection.set_auto_reconnect_pending(false);
}
