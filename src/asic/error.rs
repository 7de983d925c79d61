//! Error types for ASIC protocol and chain operations.

use thiserror::Error;

/// Frame-level protocol failures.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame CRC mismatch")]
    CrcMismatch,

    #[error("bad frame preamble: {0:02x} {1:02x}")]
    BadPreamble(u8, u8),

    #[error("short frame: need {need} bytes, have {have}")]
    ShortFrame { need: usize, have: usize },

    #[error("unknown response type: {0:#04x}")]
    InvalidResponseType(u8),

    #[error("no PLL dividers for {mhz:.2} MHz")]
    InvalidFrequency { mhz: f32 },
}

/// Chain-level failures surfaced to the orchestrator.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no chips detected on the chain")]
    NoChipsDetected,

    #[error("chain transport closed")]
    Closed,
}
