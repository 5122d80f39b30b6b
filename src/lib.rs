#![forbid(unsafe_code)]

//! Routes a tun device's traffic through the host's own TCP and UDP sockets.
//!
//! See [`PacketRouter`] for the entry point and [`packet`] for the wire formats.

pub use tunroute_packet as packet;
pub use tunroute_router::*;
