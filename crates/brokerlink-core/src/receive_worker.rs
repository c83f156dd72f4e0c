//! The receive worker (C6): one per connected socket. Reads, reassembles
//! frames, and either delivers a response directly to the waiting device or
//! hands an event off to the dispatch queue.

use std::{
    io::Read,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use brokerlink_proto::header::{Header, HEADER_SIZE, MAX_PACKET_SIZE};
use brokerlink_util::safe_panic;
use tracing::{trace, warn};

use crate::{
    connection::Connection,
    queue::{MetaEvent, WorkItem},
    types::DisconnectReason,
};

/// Runs until the socket errors, the broker closes its end, or `flag` is
/// cleared by [`Connection::disconnect`] ahead of a deliberate shutdown.
pub(crate) fn run(connection: Connection, mut stream: TcpStream, flag: Arc<AtomicBool>) {
    let mut buf = Vec::with_capacity(MAX_PACKET_SIZE * 4);
    let mut scratch = [0u8; 4096];

    loop {
        let read = stream.read(&mut scratch);
        match read {
            Ok(0) => {
                exit(&connection, &flag, DisconnectReason::Shutdown);
                return;
            }
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(err) => {
                if flag.load(Ordering::Relaxed) {
                    warn!(%err, "receive worker socket error");
                }
                exit(&connection, &flag, DisconnectReason::Error);
                return;
            }
        }

        while let Some(frame_len) = next_frame_len(&mut buf) {
            let frame: Vec<u8> = buf.drain(..frame_len).collect();
            dispatch_frame(&connection, frame);
        }
    }
}

/// Returns the length of the next complete frame in `buf`, if one is fully
/// buffered yet. A broker that sends a length byte below `HEADER_SIZE` is
/// violating the wire contract; the whole buffer is discarded rather than
/// let the header-stripping slice below panic on it.
fn next_frame_len(buf: &mut Vec<u8>) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    let length = buf[4] as usize;
    if length < HEADER_SIZE {
        safe_panic!("frame length byte {length} below header size");
        buf.clear();
        return None;
    }
    if buf.len() < length {
        return None;
    }
    Some(length)
}

fn dispatch_frame(connection: &Connection, frame: Vec<u8>) {
    let header = Header::parse(&frame[..HEADER_SIZE]);

    if header.is_event() {
        if let Some(queue) = connection.dispatch_queue() {
            queue.put(WorkItem::Packet(frame));
        }
        return;
    }

    let payload = frame[HEADER_SIZE..].to_vec();
    match connection.registry().find(header.device_id) {
        Some(device) => {
            if !device.try_deliver_response(header, payload) {
                trace!(
                    device_id = header.device_id,
                    function_id = header.function_id,
                    "response did not match any pending request"
                );
            }
        }
        None => {
            trace!(device_id = header.device_id, "response for unknown device");
        }
    }
}

/// Marks that auto-reconnect is now allowed (the receive worker is the
/// signal that the socket actually died) and tells the dispatch worker —
/// unless `flag` says this exit was requested by [`Connection::disconnect`],
/// which handles its own teardown and callback.
///
/// Deliberately never touches `socket_lock`: the dispatch worker closes and
/// clears the socket itself (`Connection::teardown_after_receive_exit`) once
/// this `DISCONNECTED` meta event reaches it. Doing the close here instead
/// would let this thread block on `socket_lock` while `disconnect()` holds
/// it across this very thread's join.
fn exit(connection: &Connection, flag: &AtomicBool, reason: DisconnectReason) {
    if !flag.swap(false, Ordering::Relaxed) {
        return;
    }

    connection.set_auto_reconnect_allowed(true);

    if let Some(queue) = connection.dispatch_queue() {
        queue.put(WorkItem::Meta(MetaEvent::Disconnected { reason }));
    }
}
