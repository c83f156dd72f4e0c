use thiserror::Error;

/// All fallible connection/device operations return this. Each variant
/// carries the legacy integer code from the wire protocol's error taxonomy
/// (see [`Error::code`]) so callers porting stub code generated against the
/// numeric contract still have it available.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("request timed out waiting for a response")]
    Timeout,
    #[error("could not create a stream socket")]
    NoStreamSocket,
    #[error("could not resolve hostname")]
    HostnameInvalid,
    #[error("could not connect to broker")]
    NoConnect,
    #[error("could not spawn worker thread")]
    NoThread,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("broker rejected an invalid parameter")]
    InvalidParameter,
    #[error("function not supported by device")]
    NotSupported,
    #[error("broker returned an unknown error code {0}")]
    UnknownErrorCode(u8),
}

impl Error {
    /// The legacy numeric error code, matching spec.md §6.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Error::Timeout => -1,
            Error::NoStreamSocket => -2,
            Error::HostnameInvalid => -3,
            Error::NoConnect => -4,
            Error::NoThread => -5,
            Error::NotConnected => -6,
            Error::AlreadyConnected => -7,
            Error::InvalidParameter => -8,
            Error::NotSupported => -9,
            Error::UnknownErrorCode(_) => -10,
        }
    }

    /// Maps a broker response error code (the low 6 bits of the header's
    /// `error_code` byte) to the caller-facing result.
    #[must_use]
    pub fn from_broker_error(broker: brokerlink_proto::header::BrokerError) -> Option<Self> {
        use brokerlink_proto::header::BrokerError;
        match broker {
            BrokerError::Ok => None,
            BrokerError::InvalidParameter => Some(Error::InvalidParameter),
            BrokerError::NotSupported => Some(Error::NotSupported),
            BrokerError::Unknown(code) => Some(Error::UnknownErrorCode(code)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec() {
        assert_eq!(Error::Timeout.code(), -1);
        assert_eq!(Error::NoStreamSocket.code(), -2);
        assert_eq!(Error::HostnameInvalid.code(), -3);
        assert_eq!(Error::NoConnect.code(), -4);
        assert_eq!(Error::NoThread.code(), -5);
        assert_eq!(Error::NotConnected.code(), -6);
        assert_eq!(Error::AlreadyConnected.code(), -7);
        assert_eq!(Error::InvalidParameter.code(), -8);
        assert_eq!(Error::NotSupported.code(), -9);
        assert_eq!(Error::UnknownErrorCode(42).code(), -10);
    }

    #[test]
    fn broker_error_mapping() {
        use brokerlink_proto::header::BrokerError;
        assert_eq!(Error::from_broker_error(BrokerError::Ok), None);
        assert_eq!(Error::from_broker_error(BrokerError::InvalidParameter), Some(Error::InvalidParameter));
        assert_eq!(Error::from_broker_error(BrokerError::NotSupported), Some(Error::NotSupported));
        assert_eq!(Error::from_broker_error(BrokerError::Unknown(9)), Some(Error::UnknownErrorCode(9)));
    }
}
