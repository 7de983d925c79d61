//! Stratum v1 client: connection lifecycle, protocol state, events.
//!
//! The client owns the socket and the request-id discipline (ids restart at
//! 1 on every connection: configure, subscribe, authorize, then submits),
//! correlates submit responses back to their shares, and supervises
//! reconnection with sticky primary/fallback failover.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::error::{StratumError, StratumResult};
use super::messages::{
    reject_reason, ClientCommand, ClientEvent, JsonRpcMessage, MiningNotification, SubmitParams,
};
use crate::tracing::prelude::*;

/// How long to wait for a response to a setup request.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between redial attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One pool's coordinates and credentials.
#[derive(Debug, Clone)]
pub struct PoolEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub primary: PoolEndpoint,
    pub fallback: PoolEndpoint,

    /// `bitaxe/<model>/<version>`.
    pub user_agent: String,

    /// Difficulty hint sent after authorization, if any.
    pub suggested_difficulty: Option<f64>,

    /// Consecutive fallback failures before retrying the primary.
    pub fallback_failure_limit: u32,
}

impl ClientConfig {
    fn endpoint(&self, fallback: bool) -> &PoolEndpoint {
        if fallback {
            &self.fallback
        } else {
            &self.primary
        }
    }
}

/// Why a session loop returned without an error.
enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// Stratum v1 client.
pub struct StratumClient {
    config: ClientConfig,
    event_tx: mpsc::Sender<ClientEvent>,
    command_rx: mpsc::Receiver<ClientCommand>,
    shutdown: CancellationToken,

    /// Request id counter; reset to 1 on every new connection.
    next_id: u64,

    /// Outstanding submits awaiting their response, by request id.
    pending_submits: HashMap<u64, String>,

    /// Failover state. Once on the fallback we stay there until it fails
    /// `fallback_failure_limit` times in a row.
    using_fallback: bool,
    fallback_failures: u32,

    /// Host/port requested by `client.reconnect`, consumed on next dial.
    reconnect_override: Option<(String, u16)>,

    /// Worker name the current session authorized with; stamped onto
    /// submits so failover cannot submit under the wrong identity.
    active_username: String,
}

impl StratumClient {
    pub fn new(
        config: ClientConfig,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            command_rx,
            shutdown,
            next_id: 1,
            pending_submits: HashMap::new(),
            using_fallback: false,
            fallback_failures: 0,
            reconnect_override: None,
            active_username: String::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Run until shutdown. Authorization failure is fatal and halts the
    /// mining loop; everything else reconnects with failover.
    pub async fn run(mut self) -> StratumResult<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_session().await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Reconnect) => {
                    info!("Reconnecting at pool request");
                }
                Err(err @ StratumError::AuthorizationFailed(_)) => {
                    error!(error = %err, "Pool rejected our credentials, halting");
                    self.event_tx.send(ClientEvent::Disconnected).await.ok();
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        fallback = self.using_fallback,
                        "Pool session ended"
                    );
                    self.event_tx.send(ClientEvent::Disconnected).await.ok();
                    self.note_failure();
                }
            }

            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Whether the client would dial the fallback pool next.
    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    fn note_failure(&mut self) {
        if self.using_fallback {
            self.fallback_failures += 1;
            if self.fallback_failures >= self.config.fallback_failure_limit {
                info!("Fallback pool keeps failing, returning to primary");
                self.using_fallback = false;
                self.fallback_failures = 0;
            }
        } else if self.config.fallback.host != self.config.primary.host
            || self.config.fallback.port != self.config.primary.port
        {
            info!(
                fallback = %self.config.fallback.host,
                "Primary pool unreachable, switching to fallback"
            );
            self.using_fallback = true;
            self.fallback_failures = 0;
        }
    }

    /// One connection's lifetime: dial, handshake, then the event loop.
    async fn run_session(&mut self) -> StratumResult<SessionEnd> {
        // Fresh connection, fresh protocol state.
        self.next_id = 1;
        self.pending_submits.clear();

        let endpoint = self.config.endpoint(self.using_fallback).clone();
        let (host, port) = self
            .reconnect_override
            .take()
            .unwrap_or_else(|| (endpoint.host.clone(), endpoint.port));

        info!(host = %host, port, fallback = self.using_fallback, "Connecting to pool");
        let mut conn = Connection::connect(&host, port).await?;

        self.configure(&mut conn).await?;
        self.subscribe(&mut conn).await?;
        self.authorize(&mut conn, &endpoint).await?;
        self.active_username = endpoint.username.clone();
        if let Some(difficulty) = self.config.suggested_difficulty {
            if let Err(err) = self.suggest_difficulty(&mut conn, difficulty).await {
                warn!(error = %err, "Difficulty suggestion failed (non-fatal)");
            }
        }

        // The link is alive; a sticky fallback earns a clean slate.
        self.fallback_failures = 0;

        loop {
            tokio::select! {
                message = conn.read_message() => {
                    match message? {
                        None => {
                            info!("Connection closed by pool");
                            return Err(StratumError::Disconnected);
                        }
                        Some(message) => {
                            if let Some(end) = self.handle_message(message).await? {
                                return Ok(end);
                            }
                        }
                    }
                }

                Some(command) = self.command_rx.recv() => {
                    match command {
                        ClientCommand::SubmitShare(params) => {
                            self.submit(&mut conn, params).await?;
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Send a request and wait for its response, handling interleaved
    /// notifications along the way.
    async fn send_request(
        &mut self,
        conn: &mut Connection,
        method: &str,
        params: Value,
    ) -> StratumResult<JsonRpcMessage> {
        let id = self.next_id();
        let message = JsonRpcMessage::request(id, method, params);
        conn.write_message(&message).await?;

        timeout(RESPONSE_TIMEOUT, async {
            loop {
                tokio::select! {
                    message = conn.read_message() => {
                        let message = message?.ok_or(StratumError::Disconnected)?;
                        match message {
                            JsonRpcMessage::Response { id: response_id, .. }
                                if response_id == id =>
                            {
                                return Ok(message);
                            }
                            other => {
                                if self.handle_message(other).await?.is_some() {
                                    return Err(StratumError::ReconnectRequested);
                                }
                            }
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout)?
    }

    /// Negotiate version rolling (`mining.configure`).
    ///
    /// A refusal is not an error; mining proceeds without rolling.
    async fn configure(&mut self, conn: &mut Connection) -> StratumResult<()> {
        let response = self
            .send_request(
                conn,
                "mining.configure",
                json!([["version-rolling"], {"version-rolling.mask": "ffffffff"}]),
            )
            .await?;

        if let JsonRpcMessage::Response {
            result: Some(result),
            ..
        } = &response
        {
            if let Some(mask_str) = result.get("version-rolling.mask").and_then(Value::as_str) {
                match u32::from_str_radix(mask_str.trim_start_matches("0x"), 16) {
                    Ok(mask) => {
                        info!(mask = format!("{mask:#010x}"), "Version rolling negotiated");
                        self.event_tx
                            .send(ClientEvent::VersionMaskSet(mask))
                            .await
                            .map_err(|_| StratumError::Disconnected)?;
                        return Ok(());
                    }
                    Err(_) => {
                        warn!(mask = %mask_str, "Unparseable version mask from pool");
                    }
                }
            }
        }

        debug!("Pool does not support version rolling");
        Ok(())
    }

    /// Subscribe (`mining.subscribe`); yields extranonce parameters.
    async fn subscribe(&mut self, conn: &mut Connection) -> StratumResult<()> {
        let response = self
            .send_request(conn, "mining.subscribe", json!([&self.config.user_agent]))
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                // [[subscriptions...], extranonce1, extranonce2_size]
                let arr = result.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("subscribe result not an array".into())
                })?;
                if arr.len() < 3 {
                    return Err(StratumError::InvalidMessage(
                        "subscribe result too short".into(),
                    ));
                }

                let extranonce1 = hex::decode(arr[1].as_str().ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce1 not a string".into())
                })?)
                .map_err(|e| StratumError::InvalidMessage(format!("extranonce1 hex: {e}")))?;

                let extranonce2_size = arr[2].as_u64().ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce2_size not a number".into())
                })? as usize;

                info!(
                    extranonce1 = %hex::encode(&extranonce1),
                    extranonce2_size,
                    "Subscribed"
                );

                self.event_tx
                    .send(ClientEvent::Subscribed {
                        extranonce1,
                        extranonce2_size,
                    })
                    .await
                    .map_err(|_| StratumError::Disconnected)?;
                Ok(())
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::SubscriptionFailed(format!("{error:?}"))),
            _ => Err(StratumError::SubscriptionFailed(
                "invalid subscribe response".into(),
            )),
        }
    }

    /// Authorize the worker (`mining.authorize`).
    async fn authorize(
        &mut self,
        conn: &mut Connection,
        endpoint: &PoolEndpoint,
    ) -> StratumResult<()> {
        let response = self
            .send_request(
                conn,
                "mining.authorize",
                json!([&endpoint.username, &endpoint.password]),
            )
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } if result.as_bool() == Some(true) => {
                info!(username = %endpoint.username, "Authorized");
                Ok(())
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::AuthorizationFailed(format!("{error:?}"))),
            _ => Err(StratumError::AuthorizationFailed(
                "pool returned false".into(),
            )),
        }
    }

    /// Hint our preferred share difficulty (`mining.suggest_difficulty`).
    async fn suggest_difficulty(
        &mut self,
        conn: &mut Connection,
        difficulty: f64,
    ) -> StratumResult<()> {
        let response = self
            .send_request(conn, "mining.suggest_difficulty", json!([difficulty]))
            .await?;

        // The pool answers with mining.set_difficulty if it cares.
        if let JsonRpcMessage::Response { result, .. } = response {
            let accepted = result.as_ref().and_then(Value::as_bool);
            debug!(accepted = ?accepted, "Difficulty suggested");
        }
        Ok(())
    }

    /// Fire a share at the pool; the response is correlated later by id.
    async fn submit(
        &mut self,
        conn: &mut Connection,
        mut params: SubmitParams,
    ) -> StratumResult<()> {
        params.username = self.active_username.clone();
        let id = self.next_id();
        let job_id = params.job_id.clone();

        debug!(job_id = %job_id, id, "Submitting share");
        let message = JsonRpcMessage::request(id, "mining.submit", Value::Array(params.to_params()));
        conn.write_message(&message).await?;
        self.pending_submits.insert(id, job_id);
        Ok(())
    }

    /// Dispatch one inbound message. Returns `Some` when the session must
    /// end (pool-requested reconnect).
    async fn handle_message(
        &mut self,
        message: JsonRpcMessage,
    ) -> StratumResult<Option<SessionEnd>> {
        match message {
            JsonRpcMessage::Request { method, params, .. } => match method.as_str() {
                "mining.notify" => {
                    let arr = params.as_array().ok_or_else(|| {
                        StratumError::InvalidMessage("notify params not an array".into())
                    })?;
                    // Malformed work is session-fatal: we cannot trust
                    // anything derived from a half-parsed notification.
                    let notification = MiningNotification::from_params(arr)
                        .map_err(StratumError::InvalidMessage)?;

                    debug!(
                        job_id = %notification.job_id,
                        clean_jobs = notification.clean_jobs,
                        "Work notification"
                    );
                    self.event_tx
                        .send(ClientEvent::Notification(notification))
                        .await
                        .map_err(|_| StratumError::Disconnected)?;
                    Ok(None)
                }

                "mining.set_difficulty" => {
                    match params.as_array().and_then(|a| a.first()).and_then(Value::as_f64) {
                        Some(difficulty) if difficulty > 0.0 => {
                            debug!(difficulty, "Pool difficulty changed");
                            self.event_tx
                                .send(ClientEvent::DifficultyChanged(difficulty))
                                .await
                                .map_err(|_| StratumError::Disconnected)?;
                        }
                        _ => warn!("Discarding malformed set_difficulty"),
                    }
                    Ok(None)
                }

                "mining.set_version_mask" => {
                    let mask = params
                        .as_array()
                        .and_then(|a| a.first())
                        .and_then(Value::as_str)
                        .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok());
                    match mask {
                        Some(mask) => {
                            info!(mask = format!("{mask:#010x}"), "Version mask set");
                            self.event_tx
                                .send(ClientEvent::VersionMaskSet(mask))
                                .await
                                .map_err(|_| StratumError::Disconnected)?;
                        }
                        None => warn!("Discarding malformed set_version_mask"),
                    }
                    Ok(None)
                }

                "client.reconnect" => {
                    // [host, port, wait] with everything optional; an empty
                    // host means re-dial the configured pool.
                    let arr = params.as_array();
                    let host = arr
                        .and_then(|a| a.first())
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let port = arr
                        .and_then(|a| a.get(1))
                        .and_then(|v| {
                            v.as_u64()
                                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                        })
                        .unwrap_or(0);

                    if !host.is_empty() && port > 0 && port <= u16::MAX as u64 {
                        info!(host = %host, port, "Pool redirected us");
                        self.reconnect_override = Some((host.to_string(), port as u16));
                    } else {
                        info!("Pool requested reconnect");
                    }
                    Ok(Some(SessionEnd::Reconnect))
                }

                other => {
                    warn!(method = %other, "Unknown notification method");
                    Ok(None)
                }
            },

            JsonRpcMessage::Response {
                id,
                result,
                error,
                reject_reason: reason,
            } => {
                let Some(job_id) = self.pending_submits.remove(&id) else {
                    debug!(id, "Response with no pending request");
                    return Ok(None);
                };

                let accepted =
                    error.is_none() && result.as_ref().and_then(Value::as_bool) == Some(true);
                let event = if accepted {
                    ClientEvent::ShareAccepted { job_id }
                } else {
                    let reason = reject_reason(error.as_ref(), reason.as_deref());
                    warn!(job_id = %job_id, reason = %reason, "Share rejected");
                    ClientEvent::ShareRejected { job_id, reason }
                };
                self.event_tx
                    .send(event)
                    .await
                    .map_err(|_| StratumError::Disconnected)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn test_config(host: String, port: u16) -> ClientConfig {
        let endpoint = PoolEndpoint {
            host,
            port,
            username: "bc1q.worker".into(),
            password: "x".into(),
        };
        ClientConfig {
            primary: endpoint.clone(),
            fallback: endpoint,
            user_agent: "bitaxe/BM1366/0.1.0".into(),
            suggested_difficulty: None,
            fallback_failure_limit: 5,
        }
    }

    async fn expect_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Scripted pool covering the handshake, a difficulty push, a job, one
    /// accepted submit and one rejected submit.
    #[tokio::test]
    async fn session_round_trip_against_scripted_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();

            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("mining.configure"), "got {line}");
            write
                .write_all(
                    concat!(
                        r#"{"id":1,"result":{"version-rolling":true,"#,
                        r#""version-rolling.mask":"1fffe000"},"error":null}"#,
                        "\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("mining.subscribe"), "got {line}");
            assert!(line.contains("bitaxe/BM1366"), "got {line}");
            write
                .write_all(
                    concat!(
                        r#"{"id":2,"result":[[["mining.notify","ae6812eb"]],"#,
                        r#""4128064f",4],"error":null}"#,
                        "\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("mining.authorize"), "got {line}");
            write
                .write_all(b"{\"id\":3,\"result\":true,\"error\":null}\n")
                .await
                .unwrap();

            // Difficulty and work pushes.
            write
                .write_all(
                    concat!(
                        r#"{"id":null,"method":"mining.set_difficulty","params":[8192]}"#,
                        "\n",
                        r#"{"id":null,"method":"mining.notify","params":["875b4b7","#,
                        r#""6b6455fd6db962c101f2d4fc0d67f4a3bc96391d000152960000000000000000","#,
                        r#""02000000","ffffffff",[],"20000000","17023a04","685468d7",false]}"#,
                        "\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            // First submit accepted, second rejected.
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.contains("mining.submit"), "got {line}");
            let msg: Value = serde_json::from_str(&line).unwrap();
            let id = msg["id"].as_u64().unwrap();
            write
                .write_all(format!("{{\"id\":{id},\"result\":true,\"error\":null}}\n").as_bytes())
                .await
                .unwrap();

            let line = lines.next_line().await.unwrap().unwrap();
            let msg: Value = serde_json::from_str(&line).unwrap();
            let id = msg["id"].as_u64().unwrap();
            write
                .write_all(
                    format!(
                        "{{\"id\":{id},\"result\":false,\"error\":null,\
                         \"reject-reason\":\"Above target\"}}\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            // Hold the socket open until the client shuts down.
            let _ = lines.next_line().await;
        });

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let client = StratumClient::new(
            test_config(addr.ip().to_string(), addr.port()),
            event_tx,
            command_rx,
            shutdown.clone(),
        );
        let client_handle = tokio::spawn(client.run());

        match expect_event(&mut event_rx).await {
            ClientEvent::VersionMaskSet(mask) => assert_eq!(mask, 0x1fffe000),
            other => panic!("expected version mask, got {other:?}"),
        }
        match expect_event(&mut event_rx).await {
            ClientEvent::Subscribed {
                extranonce1,
                extranonce2_size,
            } => {
                assert_eq!(extranonce1, hex::decode("4128064f").unwrap());
                assert_eq!(extranonce2_size, 4);
            }
            other => panic!("expected subscribed, got {other:?}"),
        }
        match expect_event(&mut event_rx).await {
            ClientEvent::DifficultyChanged(difficulty) => assert_eq!(difficulty, 8192.0),
            other => panic!("expected difficulty, got {other:?}"),
        }
        let job_id = match expect_event(&mut event_rx).await {
            ClientEvent::Notification(notification) => {
                assert!(!notification.clean_jobs);
                notification.job_id
            }
            other => panic!("expected notification, got {other:?}"),
        };

        let submit = SubmitParams {
            username: "bc1q.worker".into(),
            job_id: job_id.clone(),
            extranonce2: vec![0x17, 0, 0, 0],
            ntime: 0x685468d7,
            nonce: 0x7552034c,
            version_bits: Some(0x00b44000),
        };
        command_tx
            .send(ClientCommand::SubmitShare(submit.clone()))
            .await
            .unwrap();
        match expect_event(&mut event_rx).await {
            ClientEvent::ShareAccepted { job_id: accepted } => assert_eq!(accepted, job_id),
            other => panic!("expected accepted share, got {other:?}"),
        }

        command_tx
            .send(ClientCommand::SubmitShare(submit))
            .await
            .unwrap();
        match expect_event(&mut event_rx).await {
            ClientEvent::ShareRejected { reason, .. } => assert_eq!(reason, "Above target"),
            other => panic!("expected rejected share, got {other:?}"),
        }

        shutdown.cancel();
        let _ = client_handle.await;
        server.abort();
    }

    /// Malformed notify params must end the session (reconnect), not be
    /// silently skipped.
    #[tokio::test]
    async fn malformed_notify_is_session_fatal() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (_command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let mut client = StratumClient::new(
            test_config("127.0.0.1".into(), 1),
            event_tx,
            command_rx,
            shutdown,
        );

        let message = JsonRpcMessage::Request {
            id: None,
            method: "mining.notify".into(),
            params: json!(["job", "short-hash", "aa", "bb", [], "20000000", "1d00ffff", "0", true]),
        };
        assert!(matches!(
            client.handle_message(message).await,
            Err(StratumError::InvalidMessage(_))
        ));
    }

    /// client.reconnect overrides the next dial target.
    #[tokio::test]
    async fn reconnect_override_parsing() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (_command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let mut client = StratumClient::new(
            test_config("127.0.0.1".into(), 1),
            event_tx,
            command_rx,
            shutdown,
        );

        let message = JsonRpcMessage::Request {
            id: None,
            method: "client.reconnect".into(),
            params: json!(["other-pool.example.org", 3333, 0]),
        };
        let end = client.handle_message(message).await.unwrap();
        assert!(matches!(end, Some(SessionEnd::Reconnect)));
        assert_eq!(
            client.reconnect_override,
            Some(("other-pool.example.org".to_string(), 3333))
        );

        // Empty host: plain reconnect to the configured pool.
        let message = JsonRpcMessage::Request {
            id: None,
            method: "client.reconnect".into(),
            params: json!([]),
        };
        client.reconnect_override = None;
        let end = client.handle_message(message).await.unwrap();
        assert!(matches!(end, Some(SessionEnd::Reconnect)));
        assert_eq!(client.reconnect_override, None);
    }

    /// Failover is sticky: primary failure moves to the fallback; the
    /// fallback only yields back after repeated failures.
    #[test]
    fn failover_stickiness() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (_command_tx, command_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        let mut config = test_config("primary.example.org".into(), 3333);
        config.fallback = PoolEndpoint {
            host: "fallback.example.org".into(),
            port: 3334,
            username: "w".into(),
            password: "x".into(),
        };
        config.fallback_failure_limit = 3;
        let mut client = StratumClient::new(config, event_tx, command_rx, shutdown);

        assert!(!client.is_using_fallback());
        client.note_failure();
        assert!(client.is_using_fallback());

        client.note_failure();
        client.note_failure();
        assert!(client.is_using_fallback());
        client.note_failure();
        assert!(!client.is_using_fallback(), "returns to primary after limit");
    }
}
