use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid header: {0}")]
    Invalid(&'static str),

    /// Non-first IPv4 fragment; the transport header lives in another packet.
    #[error("non-first IP fragment")]
    Fragment,

    #[error("output buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("source and destination address families differ")]
    AddressFamilyMismatch,

    #[error("payload too large for a single IP packet ({0} bytes)")]
    PayloadTooLarge(usize),
}
