// relay-protocol: Relay wire types and serialization.
//
// Everything crossing the WebSocket is an `Envelope`: a `type` tag, an
// optional `requestId`, and whatever other top-level fields the operation
// carries.  The relay core never interprets those extra fields -- they are
// parsed into a raw JSON map and written back out unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit crossing the WebSocket in either direction.
///
/// Outbound commands (relay -> client) always carry a `requestId`; inbound
/// frames without one are dispatched as events.  The payload map is opaque
/// to the relay: binary file bodies travel inside it as base64 strings or
/// byte arrays and are passed through without re-encoding.
///
/// ```json
/// { "type": "perform-search", "requestId": "search_...", "query": "stu" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            request_id: None,
            payload: Map::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.payload.insert(key.into(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Join handshake
// ---------------------------------------------------------------------------

/// The parsed `hello` message a client must send as its first frame.
///
/// `client_id` is asserted by the client and must be a non-empty printable
/// string; `metadata` is opaque (origin URL, game system tag, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    pub client_id: String,
    pub api_key: String,
    pub metadata: Map<String, Value>,
}

/// Why a first frame was not an acceptable `hello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloRejection {
    NotHello,
    MissingClientId,
    EmptyClientId,
    MissingApiKey,
}

impl HelloRejection {
    pub fn reason(self) -> &'static str {
        match self {
            Self::NotHello => "expected hello as the first message",
            Self::MissingClientId => "hello is missing clientId",
            Self::EmptyClientId => "hello clientId must not be empty",
            Self::MissingApiKey => "hello is missing apiKey",
        }
    }
}

impl Hello {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, HelloRejection> {
        if envelope.message_type != types::HELLO {
            return Err(HelloRejection::NotHello);
        }
        let client_id = envelope
            .get_str("clientId")
            .ok_or(HelloRejection::MissingClientId)?;
        if client_id.is_empty() {
            return Err(HelloRejection::EmptyClientId);
        }
        let api_key = envelope
            .get_str("apiKey")
            .ok_or(HelloRejection::MissingApiKey)?;
        let metadata = envelope
            .payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            client_id: client_id.to_owned(),
            api_key: api_key.to_owned(),
            metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Back-channel messages
// ---------------------------------------------------------------------------

/// Body of `POST /internal/preempt`: a newer join for `client_id` happened
/// on `replica_id`; the receiving replica must release its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptNotice {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "replicaId")]
    pub replica_id: String,
}

// ---------------------------------------------------------------------------
// Message types the relay itself emits or recognizes
// ---------------------------------------------------------------------------

/// `type` values with meaning to the relay core.  Every other value is an
/// endpoint concern and passes through untouched.
pub mod types {
    pub const HELLO: &str = "hello";
    pub const JOINED: &str = "joined";
}

/// Request kinds: the fixed enumeration used for per-kind timeouts and
/// request-token prefixes.  Opaque to the core beyond those two uses.
pub mod kinds {
    pub const SEARCH: &str = "search";
    pub const ENTITY: &str = "entity";
    pub const STRUCTURE: &str = "structure";
    pub const CONTENTS: &str = "contents";
    pub const ROLL: &str = "roll";
    pub const VIEW: &str = "view";
    pub const FILES: &str = "files";
    pub const DOWNLOAD: &str = "download";
    pub const UPLOAD: &str = "upload";
    pub const MACRO: &str = "macro";
    pub const ENCOUNTER: &str = "encounter";
    pub const SELECT: &str = "select";
    pub const SCRIPT: &str = "script";
    pub const DND5E: &str = "dnd5e";
}

/// Frozen error codes surfaced in `HttpErrorEnvelope.code`.
pub mod error_codes {
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const CLIENT_NOT_FOUND: &str = "CLIENT_NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const FORWARDING_FAILED: &str = "FORWARDING_FAILED";
    pub const SEND_FAILED: &str = "SEND_FAILED";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const CLIENT_DISCONNECTED: &str = "CLIENT_DISCONNECTED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// HTTP API response types (frozen schema definitions)
// ---------------------------------------------------------------------------

/// Frozen HTTP error envelope used by all non-2xx responses.  The message
/// travels under the `error` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    #[serde(rename = "error")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Response for `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(rename = "replicaId")]
    pub replica_id: String,
    pub clients: usize,
    #[serde(rename = "directoryMode")]
    pub directory_mode: String,
    #[serde(rename = "directoryHealthy")]
    pub directory_healthy: bool,
}

/// One entry in the `GET /clients` response array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// True when the client's WebSocket is attached to the replying replica.
    pub local: bool,
    #[serde(rename = "lastSeenMs", skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<i64>,
}
