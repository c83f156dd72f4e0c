//! Client runtime for a framed request/response protocol over a persistent
//! broker connection.
//!
//! [`Connection`] owns the socket and the two worker threads that keep it
//! alive (receive and dispatch); [`Device`] is a single attached peripheral,
//! addressed by its 32-bit id and exchanging requests/events through its
//! connection.

mod connection;
mod device;
mod dispatch_worker;
mod error;
mod queue;
mod receive_worker;
mod registry;
mod types;

pub use connection::{Connection, DEFAULT_TIMEOUT_MS};
pub use device::{Device, ResponseExpected};
pub use error::{Error, Result};
pub use types::{
    ConnectReason, ConnectionState, DisconnectReason, EnumerateCallback, EnumerationType,
    CALLBACK_CONNECTED, CALLBACK_DISCONNECTED, CALLBACK_ENUMERATE,
};

pub use brokerlink_proto::decode_uid;
