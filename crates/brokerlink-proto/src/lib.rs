//! Wire codec for the broker-link device protocol.
//!
//! Three independent pieces, none of which touch IO:
//!  - [`endian`]: little-endian wire <-> host conversions
//!  - [`base58`]: base58 UID decoding and 64->32 bit folding
//!  - [`header`]: the 8-byte packet header and frame classification

pub mod base58;
pub mod endian;
pub mod header;

pub use base58::decode_uid;
pub use header::{Frame, Header, HEADER_SIZE, MAX_PACKET_SIZE};
