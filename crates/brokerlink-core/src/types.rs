//! Small enums shared across the connection manager, the workers and the
//! work queue. Kept separate from `connection.rs` so `queue.rs` doesn't need
//! to depend on the (much larger) connection module.

/// Callback id for the `connected` lifecycle callback.
pub const CALLBACK_CONNECTED: u8 = 0;
/// Callback id for the `disconnected` lifecycle callback.
pub const CALLBACK_DISCONNECTED: u8 = 2;
/// Callback id for the `enumerate` lifecycle callback.
pub const CALLBACK_ENUMERATE: u8 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// A caller-initiated `connect()`.
    Request,
    /// The dispatch worker's auto-reconnect loop succeeded.
    AutoReconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A caller-initiated `disconnect()`.
    Request,
    /// The receive worker observed a socket error.
    Error,
    /// The broker closed its end (read returned 0).
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// An auto-reconnect attempt is in flight.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationType {
    Available,
    Connected,
    Disconnected,
    Unknown(u8),
}

impl From<u8> for EnumerationType {
    fn from(v: u8) -> Self {
        match v {
            0 => EnumerationType::Available,
            1 => EnumerationType::Connected,
            2 => EnumerationType::Disconnected,
            other => EnumerationType::Unknown(other),
        }
    }
}

/// Decoded payload of an `ENUMERATE_CALLBACK` frame (spec.md §6).
#[derive(Debug, Clone)]
pub struct EnumerateCallback {
    pub uid: String,
    pub connected_uid: String,
    pub position: i8,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
    pub enumeration_type: EnumerationType,
}

/// Byte length of an `ENUMERATE_CALLBACK` payload (header stripped):
/// `uid[8] + connected_uid[8] + position:1 + hardware_version[3] +
/// firmware_version[3] + device_identifier:2 + enumeration_type:1`.
const ENUMERATE_CALLBACK_LEN: usize = 8 + 8 + 1 + 3 + 3 + 2 + 1;

impl EnumerateCallback {
    /// Decodes a payload. The broker sends `uid`/`connected_uid` as
    /// null-padded ASCII (the base58 UID string itself, not binary).
    #[must_use]
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < ENUMERATE_CALLBACK_LEN {
            return None;
        }

        fn read_cstr(bytes: &[u8]) -> String {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }

        let uid = read_cstr(&payload[0..8]);
        let connected_uid = read_cstr(&payload[8..16]);
        let position = payload[16] as i8;
        let hardware_version = [payload[17], payload[18], payload[19]];
        let firmware_version = [payload[20], payload[21], payload[22]];
        // `from_le_bytes` already yields the correct host value; running it
        // through `from_wire_u16` too would byte-swap it again on a
        // big-endian host.
        let device_identifier = u16::from_le_bytes([payload[23], payload[24]]);
        let enumeration_type = EnumerationType::from(payload[25]);

        Some(Self {
            uid,
            connected_uid,
            position,
            hardware_version,
            firmware_version,
            device_identifier,
            enumeration_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_enumerate_callback() {
        let mut payload = vec![0u8; ENUMERATE_CALLBACK_LEN];
        payload[0..3].copy_from_slice(b"abc");
        payload[8..11].copy_from_slice(b"xyz");
        payload[16] = (-1i8) as u8;
        payload[17..20].copy_from_slice(&[1, 2, 3]);
        payload[20..23].copy_from_slice(&[4, 5, 6]);
        payload[23..25].copy_from_slice(&17u16.to_le_bytes());
        payload[25] = 1;

        let decoded = EnumerateCallback::decode(&payload).unwrap();
        assert_eq!(decoded.uid, "abc");
        assert_eq!(decoded.connected_uid, "xyz");
        assert_eq!(decoded.position, -1);
        assert_eq!(decoded.hardware_version, [1, 2, 3]);
        assert_eq!(decoded.firmware_version, [4, 5, 6]);
        assert_eq!(decoded.device_identifier, 17);
        assert_eq!(decoded.enumeration_type, EnumerationType::Connected);
    }

    #[test]
    fn decode_rejects_short_payload() {
        assert!(EnumerateCallback::decode(&[0u8; 4]).is_none());
    }
}
