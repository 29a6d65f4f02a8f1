//! Stratum JSON-RPC message handling.
//!
//! Pools speak three closely related dialects that differ in framing details
//! and message shape. Request ids are fixed by purpose rather than drawn from
//! a counter: quirky pools (ethermine replies with id 999 on errors) make a
//! semantic id scheme the only reliable way to correlate.

use crate::config::ProtocolDialect;
use serde::Deserialize;
use serde_json::{json, Value};

/// Fixed request ids, one per semantic purpose
pub mod ids {
    pub const SUBSCRIBE: u64 = 1;
    pub const EXTRANONCE_SUBSCRIBE: u64 = 2;
    pub const AUTHORIZE: u64 = 3;
    pub const SUBMIT: u64 = 4;
    pub const GET_WORK: u64 = 5;
    pub const HASHRATE: u64 = 9;
    /// Some pools reply with this id when rejecting subscribe or authorize
    pub const UNKNOWN_ERROR: u64 = 999;
}

/// Lowest difficulty a pool can set
pub const MINIMUM_DIFFICULTY: f64 = 0.0001;

/// Extranonce strings are right-padded with '0' up to this many nibbles
pub const EXTRANONCE_NIBBLES: usize = 16;

/// Second element of the subscribe params for stratum dialects
const STRATUM_PROTOCOL_TAG: &str = "EnergiStratum/1.0.0";

/// One inbound frame, decoded leniently.
///
/// Every member is optional on the wire; absent members decode to `Null` so
/// classification can apply the same defaults regardless of shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub jsonrpc: Value,
    #[serde(default)]
    pub method: Value,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
}

/// What an inbound frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum MessageClass {
    /// Reply correlated to one of our fixed-id requests
    Response(u64),

    /// Server-initiated notification (or request), by method name
    Notification(String),
}

impl RpcMessage {
    /// 2 when the frame carries a `jsonrpc` member, else 1
    pub fn rpc_version(&self) -> u8 {
        if self.jsonrpc.is_null() {
            1
        } else {
            2
        }
    }

    /// The id coerced to an integer; missing or unparseable ids read as 0
    pub fn id_value(&self) -> u64 {
        match &self.id {
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// True when the `error` member is absent or null
    pub fn is_success(&self) -> bool {
        self.error.is_null()
    }

    /// The method name, empty when absent or not a string
    pub fn method_text(&self) -> &str {
        self.method.as_str().unwrap_or("")
    }

    /// Render the error member into a human-readable reason
    pub fn error_text(&self) -> String {
        error_reason(&self.error)
    }

    /// Classify as response or notification.
    ///
    /// A frame is a notification iff its id is 0 or it names a method. For
    /// eth-proxy pools a method-less notification whose `result` is an array
    /// is a job broadcast and reads as `mining.notify`.
    pub fn classify(&self, dialect: ProtocolDialect) -> MessageClass {
        let method = self.method_text();
        if self.id_value() == 0 || !method.is_empty() {
            let mut method = method.to_string();
            if method.is_empty()
                && dialect == ProtocolDialect::EthProxy
                && self.result.is_array()
            {
                method = "mining.notify".to_string();
            }
            MessageClass::Notification(method)
        } else {
            MessageClass::Response(self.id_value())
        }
    }

    /// Minimal sanity checks before dispatch.
    ///
    /// A version-2 frame must carry `jsonrpc: "2.0"`, and a notification must
    /// carry a non-empty `params` or `result`.
    pub fn validate(&self, dialect: ProtocolDialect) -> Result<(), String> {
        if self.rpc_version() == 2 && self.jsonrpc.as_str() != Some("2.0") {
            return Err(format!("jsonrpc member must be \"2.0\", got {}", self.jsonrpc));
        }
        if matches!(self.classify(dialect), MessageClass::Notification(_))
            && value_is_empty(&self.params)
            && value_is_empty(&self.result)
        {
            return Err("notification carries neither params nor result".to_string());
        }
        Ok(())
    }
}

/// Null, empty array and empty object all count as empty
fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Flatten a pool error member into one reason string.
///
/// Pools send errors as plain strings, `[code, message, data]` arrays or
/// structured objects; all three must yield something loggable.
pub fn error_reason(error: &Value) -> String {
    let rendered = match error {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(members) => members
            .iter()
            .map(|(k, v)| format!("{}:{}", k, value_to_text(v)))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if rendered.is_empty() {
        "Unknown error".to_string()
    } else {
        rendered
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Right-pad a pool extranonce with '0' to 16 nibbles.
///
/// Returns the padded string and the original hex length; the latter tells
/// the miner how many nonce bits the pool reserved.
pub fn pad_extranonce(enonce: &str) -> (String, usize) {
    let hex_size = enonce.len();
    let mut padded = enonce.to_string();
    while padded.len() < EXTRANONCE_NIBBLES {
        padded.push('0');
    }
    (padded, hex_size)
}

/// Clamp a pool-announced difficulty to the minimum
pub fn clamp_difficulty(difficulty: f64) -> f64 {
    if difficulty <= MINIMUM_DIFFICULTY {
        MINIMUM_DIFFICULTY
    } else {
        difficulty
    }
}

/// A mining job handed to the farm.
///
/// Kept opaque on purpose: the raw notify payload rides along untouched and
/// the extranonce state current at arrival is frozen into the job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Job identifier, first element of the notify payload
    pub name: String,

    /// The full notify params array as received
    pub fields: Vec<Value>,

    /// Extranonce in effect for this job, padded to 16 nibbles
    pub extra_nonce: String,

    /// Bits of the nonce space reserved by the pool
    pub ex_size_bits: usize,

    /// True when previous jobs must be abandoned
    pub new_epoch: bool,

    /// Share difficulty in effect for this job
    pub difficulty: f64,
}

impl Job {
    /// Build a job from a `mining.notify` params array.
    ///
    /// Returns `None` when the payload lacks the two header fields every
    /// usable job carries (params 2 and 3).
    pub fn from_notify(
        params: &[Value],
        extra_nonce: &str,
        extra_nonce_hex_size: usize,
        difficulty: f64,
        new_epoch: bool,
    ) -> Option<Self> {
        let header_a = params.get(2).and_then(Value::as_str).unwrap_or("");
        let header_b = params.get(3).and_then(Value::as_str).unwrap_or("");
        if header_a.is_empty() || header_b.is_empty() {
            return None;
        }

        Some(Self {
            name: params
                .first()
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            fields: params.to_vec(),
            extra_nonce: extra_nonce.to_string(),
            ex_size_bits: extra_nonce_hex_size * 4,
            new_epoch,
            difficulty,
        })
    }

    /// Build a job from a `getblocktemplate` result object
    pub fn from_template(template: &Value) -> Self {
        Self {
            name: template
                .get("previousblockhash")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            fields: vec![template.clone()],
            extra_nonce: String::new(),
            ex_size_bits: 0,
            new_epoch: true,
            difficulty: 1.0,
        }
    }
}

/// A candidate proof-of-work produced by the farm
#[derive(Debug, Clone)]
pub struct Solution {
    /// Job this solution answers
    pub job_name: String,

    /// Extranonce the job was mined with
    pub extra_nonce: String,

    /// Block time field, as the pool formatted it
    pub time: String,

    /// Winning nonce
    pub nonce: u64,

    /// Mix hash, hex encoded
    pub hash_mix: String,

    /// Solved block header as 32-bit words, for getwork submission
    pub block_header: Vec<u32>,

    /// Raw transaction data appended after the header, hex encoded
    pub transaction_hex: String,
}

impl Solution {
    /// Serialize the block for `submitblock`: each header word big-endian,
    /// hex encoded, followed by the raw transaction data.
    pub fn submit_block_data(&self) -> String {
        let mut data = String::with_capacity(self.block_header.len() * 8 + self.transaction_hex.len());
        for word in &self.block_header {
            data.push_str(&hex::encode(word.to_be_bytes()));
        }
        data.push_str(&self.transaction_hex);
        data
    }
}

/// id=1 subscribe, shaped per dialect
pub fn subscribe_request(dialect: ProtocolDialect, user_agent: &str) -> Value {
    let params = match dialect {
        ProtocolDialect::Stratum | ProtocolDialect::EthereumStratum => {
            json!([user_agent, STRATUM_PROTOCOL_TAG])
        }
        ProtocolDialect::EthProxy => json!([]),
    };
    json!({
        "id": ids::SUBSCRIBE,
        "method": "mining.subscribe",
        "params": params,
    })
}

/// id=2 extranonce subscription (ethereum stratum only)
pub fn extranonce_subscribe_request() -> Value {
    json!({
        "id": ids::EXTRANONCE_SUBSCRIBE,
        "method": "mining.extranonce.subscribe",
        "params": [],
    })
}

/// id=3 authorize; classic stratum frames it as JSON-RPC 2.0
pub fn authorize_request(dialect: ProtocolDialect, login: &str, pass: &str) -> Value {
    let mut request = json!({
        "id": ids::AUTHORIZE,
        "method": "mining.authorize",
        "params": [login, pass],
    });
    if dialect == ProtocolDialect::Stratum {
        request["jsonrpc"] = json!("2.0");
    }
    request
}

/// id=5 initial work request (eth-proxy only)
pub fn get_work_request() -> Value {
    json!({
        "id": ids::GET_WORK,
        "method": "getblocktemplate",
        "params": [],
    })
}

/// id=4 solution submission, shaped per dialect.
///
/// The `worker` top-level key is a pool extension carrying the worker name
/// split off the user string; ethereum stratum pools refuse it.
pub fn submit_request(
    dialect: ProtocolDialect,
    solution: &Solution,
    user: &str,
    worker_suffix: &str,
) -> Value {
    let mut request = match dialect {
        ProtocolDialect::Stratum => json!({
            "id": ids::SUBMIT,
            "jsonrpc": "2.0",
            "method": "mining.submit",
            "params": [
                user,
                solution.job_name,
                solution.extra_nonce,
                solution.time,
                solution.nonce.to_string(),
                solution.hash_mix,
            ],
        }),
        ProtocolDialect::EthProxy => json!({
            "id": ids::SUBMIT,
            "method": "submitblock",
            "params": [
                solution.job_name,
                solution.extra_nonce,
                solution.time,
                solution.nonce.to_string(),
                solution.hash_mix,
            ],
        }),
        ProtocolDialect::EthereumStratum => json!({
            "id": ids::SUBMIT,
            "method": "mining.submit",
            "params": [
                user,
                solution.job_name,
                solution.extra_nonce,
                solution.time,
                solution.nonce.to_string(),
                solution.hash_mix,
            ],
        }),
    };
    if dialect != ProtocolDialect::EthereumStratum && !worker_suffix.is_empty() {
        request["worker"] = json!(worker_suffix);
    }
    request
}

/// Reply to a `client.get_version` probe, echoing the id the pool used
pub fn get_version_reply(id: u64, rpc_version: u8, version: &str) -> Value {
    let mut reply = json!({
        "id": id.to_string(),
        "result": version,
    });
    if rpc_version == 2 {
        reply["jsonrpc"] = json!("2.0");
    } else {
        reply["error"] = Value::Null;
    }
    reply
}

/// id=9 hashrate report in the rpc variant, since stratum has no method for it
pub fn hashrate_request(rate: &str, miner_id: &str, worker_suffix: &str) -> Value {
    let mut request = json!({
        "id": ids::HASHRATE,
        "jsonrpc": "2.0",
        "method": "eth_submitHashrate",
        "params": [rate, miner_id],
    });
    if !worker_suffix.is_empty() {
        request["worker"] = json!(worker_suffix);
    }
    request
}
