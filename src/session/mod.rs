//! The bidirectional streaming session: wire protocol, transport, and the
//! lifecycle controller.

pub mod controller;
pub mod protocol;
pub mod transport;
