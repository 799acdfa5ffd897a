//! Encrypted-tunnel collaborator wire codec

mod frame;

pub use frame::{
    classify, disconnect, encode_handshake, keepalive, parse_parameters, RelayFrame,
    TunnelParameters, CONTROL_PREFIX, DISCONNECT_MARKER,
};
