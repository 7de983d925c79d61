//! Mining pipeline core for BM13xx-based single-board Bitcoin miners.
//!
//! The crate couples a Stratum V1 pool client, a job construction engine,
//! and a BM13xx ASIC chain driver through a four-task pipeline with bounded
//! queues and epoch-based work abandonment. Peripheral firmware concerns
//! (network bring-up, screens, HTTP surfaces) are collaborators behind the
//! [`settings`] interface and are not implemented here.

pub mod asic;
pub mod job;
pub mod pipeline;
pub mod settings;
pub mod stratum_v1;
pub mod tracing;
pub mod types;
