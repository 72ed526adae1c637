use std::net::SocketAddr;

pub const INBOUND_CAP: usize = 256;
pub const OUTBOUND_CAP: usize = 256;

pub enum InboundMsg {
    ClientConnected { socket_addr: SocketAddr },
    ClientDisconnected,
    Request { envelope: ApiEnvelope },
}

pub enum OutboundMsg {
    Send { envelope: ApiEnvelope },
    /// Drop the active client without waiting for it to close.
    Kick,
}

pub use vts_protocol::{error_id, ApiEnvelope, ApiErrorData, ApiRequest, Hotkey};
