//! Realtime channel: wire protocol, gateway and WebSocket transport

pub mod gateway;
pub mod handler;
pub mod protocol;
