use serde::{Deserialize, Serialize};

/// Gateway opcodes. The set is protocol-defined and closed, so handlers
/// match exhaustively instead of dispatching dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Sequenced server event (the server side calls this EVENT).
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    Resume = 3,
    HeartbeatAck = 4,
    Hello = 5,
    Reconnect = 6,
    InvalidSession = 7,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Opcode> {
        match op {
            0 => Some(Opcode::Dispatch),
            1 => Some(Opcode::Heartbeat),
            2 => Some(Opcode::Identify),
            3 => Some(Opcode::Resume),
            4 => Some(Opcode::HeartbeatAck),
            5 => Some(Opcode::Hello),
            6 => Some(Opcode::Reconnect),
            7 => Some(Opcode::InvalidSession),
            _ => None,
        }
    }
}

/// Close codes.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_VERSION: u16 = 4012;
    pub const INVALID_INTENT: u16 = 4013;
    pub const DISALLOWED_INTENT: u16 = 4014;

    /// Codes after which reconnecting cannot succeed without operator
    /// intervention (bad credentials, bad identify payload).
    pub fn is_fatal(code: u16) -> bool {
        matches!(
            code,
            AUTH_FAILED | INVALID_VERSION | INVALID_INTENT | DISALLOWED_INTENT
        )
    }
}

/// Gateway message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// HELLO (opcode 5) payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: Option<u64>,
}

/// Client identity advertised in IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub device: String,
    pub version: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            device: "accordclient".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// IDENTIFY (opcode 2) payload data.
#[derive(Debug, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub properties: ConnectionProperties,
    /// Bitmask over `gateway::intents`.
    pub intents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u64>,
    /// `[shard_id, shard_count]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
}

/// RESUME (opcode 3) payload data.
#[derive(Debug, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// INVALID_SESSION (opcode 7) payload data.
#[derive(Debug, Deserialize)]
pub struct InvalidSessionData {
    #[serde(default)]
    pub resumable: bool,
}

/// One sequenced DISPATCH event as handed to the sequencer and, in order,
/// to event handlers.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub sequence: u64,
    pub event_type: String,
    pub data: serde_json::Value,
}
