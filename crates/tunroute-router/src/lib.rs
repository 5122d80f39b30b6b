#![forbid(unsafe_code)]

//! User-space NAT between a tun device and the host's sockets.
//!
//! Every IP packet the device emits is classified and handed to a flow manager: TCP connections
//! are terminated locally and spliced onto an upstream `TcpStream`, UDP flows get a connected
//! `UdpSocket` each. Replies are synthesized as complete IP packets (addresses swapped, checksums
//! recomputed) and written back to the device.
//!
//! Threads and tasks of a running [`PacketRouter`]:
//! - a device reader thread, dispatching parsed packets to per-protocol queues;
//! - a TCP and a UDP manager task owning session creation and device-side state;
//! - one task per session driving its upstream socket;
//! - a device writer thread draining the shared outbound queue;
//! - a sweeper evicting idle sessions.

mod config;
mod context;
mod device;
mod error;
mod flow;
mod metrics;
mod pool;
mod router;
mod session;
mod tcb;
mod tcp;
mod udp;
mod upstream;

pub use config::{RouterConfig, MIN_MTU};
pub use device::Tunnel;
pub use error::{PoolExhausted, RouterError};
pub use flow::{FlowKey, Packet, Transport};
pub use metrics::{DropReason, Metrics, MetricsSnapshot};
pub use pool::{Buffer, BufferPool};
pub use router::PacketRouter;
