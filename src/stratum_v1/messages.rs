//! Stratum v1 message types and JSON-RPC serialization.

use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session parameters negotiated with the pool.
///
/// Set by the subscribe/configure responses, mutated by difficulty and
/// version-mask pushes, and read by the job builder on every job. Stable
/// across jobs; replaced wholesale on reconnect.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Server-assigned extranonce prefix.
    pub extranonce1: Vec<u8>,
    /// Width of the locally chosen extranonce suffix, in bytes.
    pub extranonce2_size: usize,
    /// Version bits the pool lets us roll; 0 disables rolling.
    pub version_mask: u32,
    /// Current share difficulty.
    pub pool_difficulty: f64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            extranonce1: Vec::new(),
            extranonce2_size: 4,
            version_mask: 0,
            pool_difficulty: 1.0,
        }
    }
}

/// Events emitted by the client toward the pipeline.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Subscribe handshake completed.
    Subscribed {
        extranonce1: Vec<u8>,
        extranonce2_size: usize,
    },

    /// New work from the pool.
    Notification(MiningNotification),

    /// Pool changed the share difficulty.
    DifficultyChanged(f64),

    /// Pool set (or negotiated) the version-rolling mask.
    VersionMaskSet(u32),

    /// A submitted share was accepted.
    ShareAccepted { job_id: String },

    /// A submitted share was rejected.
    ShareRejected { job_id: String, reason: String },

    /// Connection lost; the client is reconnecting.
    Disconnected,
}

/// Commands sent to the client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    SubmitShare(SubmitParams),
}

/// Mining job notification (`mining.notify`).
#[derive(Debug, Clone)]
pub struct MiningNotification {
    /// Pool-scoped opaque job identifier.
    pub job_id: String,

    /// Previous block hash, converted to hashing byte order.
    pub prev_block_hash: BlockHash,

    /// Coinbase prefix, before the extranonces.
    pub coinbase_1: Vec<u8>,

    /// Coinbase suffix, after the extranonces.
    pub coinbase_2: Vec<u8>,

    /// Merkle path from the coinbase to the root, in order.
    pub merkle_branches: Vec<TxMerkleNode>,

    /// Block version.
    pub version: Version,

    /// Compact network target.
    pub nbits: CompactTarget,

    /// Block timestamp.
    pub ntime: u32,

    /// When set, all outstanding work must be abandoned at once.
    pub clean_jobs: bool,
}

impl MiningNotification {
    /// Parse from the `mining.notify` params array.
    ///
    /// Manual field-by-field parsing keeps the error context useful; any
    /// malformed field is a session-fatal protocol error upstream.
    pub fn from_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }

        let job_id = params[0].as_str().ok_or("job_id not a string")?.to_string();

        let prev_hash_str = params[1].as_str().ok_or("prev_hash not a string")?;
        let prev_block_hash = parse_block_hash(prev_hash_str)?;

        let coinbase_1 = hex::decode(params[2].as_str().ok_or("coinbase_1 not a string")?)
            .map_err(|e| format!("coinbase_1 hex: {e}"))?;
        let coinbase_2 = hex::decode(params[3].as_str().ok_or("coinbase_2 not a string")?)
            .map_err(|e| format!("coinbase_2 hex: {e}"))?;

        let branches_json = params[4].as_array().ok_or("merkle_branches not an array")?;
        let mut merkle_branches = Vec::with_capacity(branches_json.len());
        for branch in branches_json {
            let branch_str = branch.as_str().ok_or("merkle branch not a string")?;
            merkle_branches.push(parse_merkle_node(branch_str)?);
        }

        let version_u32 =
            u32::from_str_radix(params[5].as_str().ok_or("version not a string")?, 16)
                .map_err(|e| format!("version hex: {e}"))?;
        let version = Version::from_consensus(version_u32 as i32);

        let nbits_u32 = u32::from_str_radix(params[6].as_str().ok_or("nbits not a string")?, 16)
            .map_err(|e| format!("nbits hex: {e}"))?;
        let nbits = CompactTarget::from_consensus(nbits_u32);

        let ntime = u32::from_str_radix(params[7].as_str().ok_or("ntime not a string")?, 16)
            .map_err(|e| format!("ntime hex: {e}"))?;

        let clean_jobs = params[8].as_bool().ok_or("clean_jobs not a bool")?;

        Ok(Self {
            job_id,
            prev_block_hash,
            coinbase_1,
            coinbase_2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

/// Parse a block hash from its Stratum encoding.
///
/// Stratum transmits the 256-bit hash as eight 32-bit words in hashing
/// word order, but each word is hex-printed big-endian. Reversing the bytes
/// within each 4-byte word recovers the hashing byte order.
fn parse_block_hash(hex_str: &str) -> Result<BlockHash, String> {
    let mut bytes = hex::decode(hex_str).map_err(|e| format!("block hash hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("block hash wrong length: {}", bytes.len()));
    }

    for chunk in bytes.chunks_mut(4) {
        chunk.reverse();
    }

    BlockHash::from_slice(&bytes).map_err(|e| format!("block hash parse: {e}"))
}

/// Parse a merkle node; transmitted in hashing byte order as-is.
fn parse_merkle_node(hex_str: &str) -> Result<TxMerkleNode, String> {
    let bytes = hex::decode(hex_str).map_err(|e| format!("merkle node hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("merkle node wrong length: {}", bytes.len()));
    }
    TxMerkleNode::from_slice(&bytes).map_err(|e| format!("merkle node parse: {e}"))
}

/// Share submission parameters (`mining.submit`).
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    pub nonce: u32,
    /// Rolled version bits, present when version rolling was negotiated.
    pub version_bits: Option<u32>,
}

impl SubmitParams {
    /// Render to the Stratum params array (hex string fields).
    pub fn to_params(&self) -> Vec<Value> {
        let mut params = vec![
            Value::String(self.username.clone()),
            Value::String(self.job_id.clone()),
            Value::String(hex::encode(&self.extranonce2)),
            Value::String(format!("{:08x}", self.ntime)),
            Value::String(format!("{:08x}", self.nonce)),
        ];
        if let Some(version_bits) = self.version_bits {
            params.push(Value::String(format!("{:08x}", version_bits)));
        }
        params
    }
}

/// JSON-RPC message envelope.
///
/// Requests and notifications carry a method; responses echo the request
/// id with a result or error. Some pools attach a top-level `reject-reason`
/// to failed submits.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request {
        id: Option<u64>,
        method: String,
        params: Value,
    },

    Response {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
        #[serde(
            default,
            rename = "reject-reason",
            skip_serializing_if = "Option::is_none"
        )]
        reject_reason: Option<String>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: Some(id),
            method: method.into(),
            params,
        }
    }
}

/// Extract a human-readable reason from a submit error payload.
///
/// Pools send either `error: [code, "message", ...]` or a top-level
/// `reject-reason` string.
pub(crate) fn reject_reason(error: Option<&Value>, reject_reason: Option<&str>) -> String {
    if let Some(reason) = reject_reason {
        return reason.to_string();
    }
    if let Some(Value::Array(items)) = error {
        if let Some(Value::String(message)) = items.get(1) {
            return message.clone();
        }
    }
    "unknown".to_string()
}
