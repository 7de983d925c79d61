//! Stratum v1 pool client.
//!
//! Line-delimited JSON-RPC over TCP: the client negotiates version rolling,
//! subscribes, authorizes, then bridges pool notifications and share
//! submissions over channels. Connection loss and pool-requested reconnects
//! are handled internally with sticky primary/fallback failover.

mod client;
mod connection;
mod error;
mod messages;

pub use client::{ClientConfig, PoolEndpoint, StratumClient};
pub use connection::Connection;
pub use error::{StratumError, StratumResult};
pub use messages::{
    ClientCommand, ClientEvent, JsonRpcMessage, MiningNotification, SessionParams, SubmitParams,
};
