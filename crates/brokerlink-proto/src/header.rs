//! The fixed 8-byte packet header and classification of a fully-read frame
//! into an event or a response.

/// Header size in bytes: `device_id:u32 | length:u8 | function_id:u8 | flags:u8 | error_code:u8`.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single packet (header + payload), matching the broker.
pub const MAX_PACKET_SIZE: usize = 80;

/// `flags` byte: bits 0..=3 hold the sequence number.
const SEQUENCE_NUMBER_MASK: u8 = 0x0F;
/// `flags` byte: bit 4 is the response-expected flag.
const RESPONSE_EXPECTED_BIT: u8 = 0x10;
/// `error_code` byte: only the low 6 bits are defined.
const ERROR_CODE_MASK: u8 = 0x3F;

/// Function id of the enumerate callback (an unsolicited event).
pub const FUNCTION_ENUMERATE_CALLBACK: u8 = 253;
/// Function id of the enumerate request.
pub const FUNCTION_ENUMERATE: u8 = 254;

/// Broker-reported error code on a response, decoded from the low 6 bits of
/// the header's `error_code` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    Ok,
    InvalidParameter,
    NotSupported,
    Unknown(u8),
}

impl From<u8> for BrokerError {
    fn from(raw: u8) -> Self {
        match raw & ERROR_CODE_MASK {
            0 => BrokerError::Ok,
            1 => BrokerError::InvalidParameter,
            2 => BrokerError::NotSupported,
            other => BrokerError::Unknown(other),
        }
    }
}

/// A parsed 8-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub device_id: u32,
    pub length: u8,
    pub function_id: u8,
    /// 0 means "this is an event", 1..=15 correlates a response to its request.
    pub sequence_number: u8,
    pub response_expected: bool,
    pub error_code: u8,
}

impl Header {
    /// Builds a header for an outgoing request/event.
    #[inline]
    pub fn new(
        device_id: u32,
        length: u8,
        function_id: u8,
        sequence_number: u8,
        response_expected: bool,
    ) -> Self {
        debug_assert!(sequence_number <= SEQUENCE_NUMBER_MASK);
        Self { device_id, length, function_id, sequence_number, response_expected, error_code: 0 }
    }

    /// Parses a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    #[inline]
    pub fn parse(buf: &[u8]) -> Self {
        // `from_le_bytes` already yields the correct host value from wire
        // bytes; do not also run it through `from_wire_u32`, which would
        // byte-swap it a second time on a big-endian host.
        let device_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let length = buf[4];
        let function_id = buf[5];
        let flags = buf[6];
        let error_code = buf[7] & ERROR_CODE_MASK;

        Self {
            device_id,
            length,
            function_id,
            sequence_number: flags & SEQUENCE_NUMBER_MASK,
            response_expected: flags & RESPONSE_EXPECTED_BIT != 0,
            error_code,
        }
    }

    /// Serializes the header into the first [`HEADER_SIZE`] bytes of `out`.
    ///
    /// # Panics
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    #[inline]
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.device_id.to_le_bytes());
        out[4] = self.length;
        out[5] = self.function_id;
        out[6] = (self.sequence_number & SEQUENCE_NUMBER_MASK) |
            if self.response_expected { RESPONSE_EXPECTED_BIT } else { 0 };
        out[7] = self.error_code & ERROR_CODE_MASK;
    }

    #[inline]
    pub fn is_event(&self) -> bool {
        self.sequence_number == 0
    }

    #[inline]
    pub fn broker_error(&self) -> BrokerError {
        BrokerError::from(self.error_code)
    }
}

/// A classified frame: either an unsolicited event or a response correlated
/// by function id + sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Event { device_id: u32, function_id: u8 },
    Response { device_id: u32, function_id: u8, sequence_number: u8, error_code: u8 },
}

/// Classifies an already-parsed header.
#[inline]
pub fn classify(header: &Header) -> Frame {
    if header.is_event() {
        Frame::Event { device_id: header.device_id, function_id: header.function_id }
    } else {
        Frame::Response {
            device_id: header.device_id,
            function_id: header.function_id,
            sequence_number: header.sequence_number,
            error_code: header.error_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = Header::new(0x1234_5678, 12, 1, 7, true);
        let mut buf = [0u8; HEADER_SIZE];
        h.write_to(&mut buf);
        let parsed = Header::parse(&buf);
        assert_eq!(parsed, h);
        assert!(parsed.sequence_number >= 1 && parsed.sequence_number <= 15);
        assert!(parsed.response_expected);
    }

    #[test]
    fn sequence_zero_is_event() {
        let h = Header::new(1, 8, 253, 0, false);
        assert!(h.is_event());
        assert!(matches!(classify(&h), Frame::Event { function_id: 253, .. }));
    }

    #[test]
    fn nonzero_sequence_is_response() {
        let h = Header::new(1, 8, 1, 3, true);
        assert!(!h.is_event());
        assert!(matches!(
            classify(&h),
            Frame::Response { sequence_number: 3, function_id: 1, .. }
        ));
    }

    #[test]
    fn error_code_decode() {
        assert_eq!(BrokerError::from(0), BrokerError::Ok);
        assert_eq!(BrokerError::from(1), BrokerError::InvalidParameter);
        assert_eq!(BrokerError::from(2), BrokerError::NotSupported);
        assert_eq!(BrokerError::from(5), BrokerError::Unknown(5));
        // top two reserved bits are masked off
        assert_eq!(BrokerError::from(0b1100_0001), BrokerError::InvalidParameter);
    }

    #[test]
    fn response_expected_bit_is_bit4() {
        let h = Header::new(1, 8, 1, 1, true);
        let mut buf = [0u8; HEADER_SIZE];
        h.write_to(&mut buf);
        assert_eq!(buf[6], 0x11);
    }
}
