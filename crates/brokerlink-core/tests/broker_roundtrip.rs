use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use brokerlink_core::{Connection, ConnectReason, Device, DisconnectReason, Error};
use brokerlink_proto::header::{Header, HEADER_SIZE};

fn read_frame(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).unwrap();
    let header = Header::parse(&header_buf);
    let mut payload = vec![0u8; header.length as usize - HEADER_SIZE];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).unwrap();
    }
    (header, payload)
}

fn write_frame(stream: &mut TcpStream, header: Header, payload: &[u8]) {
    let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
    header.write_to(&mut frame);
    frame[HEADER_SIZE..].copy_from_slice(payload);
    stream.write_all(&frame).unwrap();
}

#[test]
fn request_response_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let (header, _payload) = read_frame(&mut stream);
        let response = Header::new(
            header.device_id,
            (HEADER_SIZE + 2) as u8,
            header.function_id,
            header.sequence_number,
            false,
        );
        write_frame(&mut stream, response, &[9, 9]);
    });

    let conn = Connection::new();
    conn.connect("127.0.0.1", addr.port()).unwrap();
    let device = Device::new(1, &conn);
    device.set_response_expected(7, true);

    let result = device.send_request(7, &[]).unwrap();
    assert_eq!(result, vec![9, 9]);

    server.join().unwrap();
    let _ = conn.disconnect();
}

#[test]
fn request_times_out_without_a_response() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let conn = Connection::new();
    conn.connect("127.0.0.1", addr.port()).unwrap();
    conn.set_timeout_ms(50);
    let device = Device::new(2, &conn);
    device.set_response_expected(3, true);

    let err = device.send_request(3, &[]).unwrap_err();
    assert_eq!(err, Error::Timeout);

    server.join().unwrap();
    let _ = conn.disconnect();
}

#[test]
fn event_is_dispatched_to_registered_handler() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(100));
        let header = Header::new(5, (HEADER_SIZE + 1) as u8, 20, 0, false);
        write_frame(&mut stream, header, &[42]);
        thread::sleep(Duration::from_millis(100));
    });

    let conn = Connection::new();
    conn.connect("127.0.0.1", addr.port()).unwrap();
    let device = Device::new(5, &conn);

    let (tx, rx) = mpsc::channel();
    device.register_handler(20, move |payload: &[u8]| {
        let _ = tx.send(payload.to_vec());
    });

    let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(received, vec![42]);

    server.join().unwrap();
    let _ = conn.disconnect();
}

#[test]
fn auto_reconnects_after_the_broker_drops_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let conn = Connection::new();
    let (connected_tx, connected_rx) = mpsc::channel();
    let (disconnected_tx, disconnected_rx) = mpsc::channel();
    conn.register_connected(move |reason| {
        let _ = connected_tx.send(reason);
    });
    conn.register_disconnected(move |reason| {
        let _ = disconnected_tx.send(reason);
    });

    let first_accept = thread::spawn(move || listener.accept().unwrap());
    conn.connect("127.0.0.1", addr.port()).unwrap();
    assert_eq!(
        connected_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ConnectReason::Request
    );

    let (stream, _) = first_accept.join().unwrap();
    drop(stream);

    assert_eq!(
        disconnected_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        DisconnectReason::Shutdown
    );

    let listener2 = TcpListener::bind(addr).unwrap();
    let _second_accept = listener2.accept().unwrap();

    assert_eq!(
        connected_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ConnectReason::AutoReconnect
    );

    let _ = conn.disconnect();
}
