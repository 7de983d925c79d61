//! TCP connection with line framing.
//!
//! One JSON object per `\n`-terminated line in both directions. Inbound
//! bytes accumulate in the codec buffer across socket reads; a single
//! unparseable line is logged and discarded rather than killing the
//! session.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line we will buffer from a pool.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Dial timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A line-framed pool connection.
pub struct Connection {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Connection {
    /// Connect to `host:port`. Accepts a bare host or a
    /// `stratum+tcp://` URL.
    pub async fn connect(host: &str, port: u16) -> StratumResult<Self> {
        let host = host
            .trim_start_matches("stratum+tcp://")
            .trim_end_matches('/');

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| StratumError::Timeout)??;
        stream.set_nodelay(true)?;

        debug!(host, port, "Connected to pool");

        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        })
    }

    /// Serialize and send one message.
    pub async fn write_message(&mut self, message: &JsonRpcMessage) -> StratumResult<()> {
        let line = serde_json::to_string(message)
            .map_err(|e| StratumError::InvalidMessage(e.to_string()))?;
        debug!(tx = %line, "stratum");
        self.framed.send(line).await.map_err(map_codec_error)
    }

    /// Read the next message. `Ok(None)` means the pool closed the socket.
    ///
    /// Lines that fail to parse as JSON-RPC are discarded with a warning.
    pub async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let line = match self.framed.next().await {
                None => return Ok(None),
                Some(Err(err)) => return Err(map_codec_error(err)),
                Some(Ok(line)) => line,
            };

            trace!(rx = %line, "stratum");

            match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(message) => return Ok(Some(message)),
                Err(err) => {
                    warn!(error = %err, line = %line, "Discarding unparseable line");
                }
            }
        }
    }
}

fn map_codec_error(err: LinesCodecError) -> StratumError {
    match err {
        LinesCodecError::Io(io) => StratumError::Io(io),
        LinesCodecError::MaxLineLengthExceeded => {
            StratumError::InvalidMessage("line too long".to_string())
        }
    }
}
