use std::io;

use thiserror::Error;

/// Router-level failures surfaced to the owner of a [`crate::PacketRouter`].
///
/// Per-packet and per-session problems never show up here; they are counted in
/// [`crate::Metrics`] and recovered locally.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("tunnel read failed: {0}")]
    TunnelRead(#[source] io::Error),

    #[error("tunnel write failed: {0}")]
    TunnelWrite(#[source] io::Error),

    #[error("router is already running")]
    AlreadyRunning,

    #[error("router must be started from within a tokio runtime")]
    NoRuntime,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Returned by [`crate::BufferPool::acquire`] once the hard ceiling of in-flight buffers is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer pool exhausted ({outstanding} buffers in flight)")]
pub struct PoolExhausted {
    pub outstanding: usize,
}
