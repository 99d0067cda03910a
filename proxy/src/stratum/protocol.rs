/// Stratum JSON-RPC message types
///
/// Browser miners speak the XMRig flavour of Stratum (login / submit /
/// keepalived / job) over WebSocket; pools speak the same objects as
/// newline-delimited JSON over TCP.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fee::Identity;
use crate::registry::DEFAULT_COIN;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has neither method nor id")]
    Unclassified,
    #[error("client frame has no method")]
    MissingMethod,
}

/// One JSON-RPC object, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request { id: Value, method: String, params: Value },
    Response { id: Value, result: Option<Value>, error: Option<Value> },
    /// Server push without an id (e.g. `job`).
    Notification { method: String, params: Value },
}

impl RpcMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        let id = obj.remove("id").filter(|v| !v.is_null());
        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = obj.remove("params").unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => Ok(Self::Response {
                id,
                result: obj.remove("result").filter(|v| !v.is_null()),
                error: obj.remove("error").filter(|v| !v.is_null()),
            }),
            (None, None) => Err(FrameError::Unclassified),
        }
    }

    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }
}

/// `login` params sent by the browser miner. Unknown fields stay in the raw
/// frame and are forwarded untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub login: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    #[serde(default)]
    pub agent: Option<String>,
    /// Proxy-only: preset key to mine on.
    #[serde(default)]
    pub pool: Option<String>,
    /// Proxy-only: coin whose fallback chain to use.
    #[serde(default)]
    pub coin: Option<String>,
}

fn default_pass() -> String {
    "x".to_string()
}

impl LoginParams {
    pub fn coin(&self) -> &str {
        self.coin.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_COIN)
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.login.clone(), self.pass.clone())
    }
}

/// Client methods the proxy knows about.
#[derive(Debug, Clone)]
pub enum ClientCall {
    Login(LoginParams),
    /// Share submission, always forwarded verbatim.
    Submit,
    KeepAlive,
    GetJob,
    Unknown(String),
}

impl ClientCall {
    pub fn name(&self) -> &str {
        match self {
            Self::Login(_) => "login",
            Self::Submit => "submit",
            Self::KeepAlive => "keepalived",
            Self::GetJob => "getjob",
            Self::Unknown(m) => m,
        }
    }
}

/// A parsed client frame: the raw object plus its classified call.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub id: Value,
    pub call: ClientCall,
    raw: Map<String, Value>,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let Value::Object(raw) = serde_json::from_str::<Value>(text)? else {
            return Err(FrameError::NotAnObject);
        };
        let method = raw
            .get("method")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingMethod)?;

        let call = match method {
            "login" => {
                let params = raw.get("params").cloned().unwrap_or(Value::Object(Map::new()));
                ClientCall::Login(serde_json::from_value(params)?)
            }
            "submit" => ClientCall::Submit,
            "keepalived" => ClientCall::KeepAlive,
            "getjob" => ClientCall::GetJob,
            other => ClientCall::Unknown(other.to_string()),
        };
        let id = raw.get("id").cloned().unwrap_or(Value::Null);

        Ok(Self { id, call, raw })
    }

    pub fn is_login(&self) -> bool {
        matches!(self.call, ClientCall::Login(_))
    }

    /// Newline-terminated wire form, unmodified.
    pub fn to_line(&self) -> String {
        encode_line(&self.raw)
    }

    /// Newline-terminated wire form with `params.login` / `params.pass`
    /// replaced. Only meaningful for login frames.
    pub fn to_line_as(&self, identity: &Identity) -> String {
        let mut raw = self.raw.clone();
        if let Some(Value::Object(params)) = raw.get_mut("params") {
            params.insert("login".to_string(), Value::String(identity.login.clone()));
            params.insert("pass".to_string(), Value::String(identity.pass.clone()));
        }
        encode_line(&raw)
    }
}

fn encode_line(obj: &Map<String, Value>) -> String {
    // Serializing a Map<String, Value> cannot fail
    let mut line = Value::Object(obj.clone()).to_string();
    line.push('\n');
    line
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"internal error"}}"#.to_string()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StratumError {
    pub const UNKNOWN: i32 = -1;
    pub const INVALID_METHOD: i32 = -32601;
    /// All pools in the fallback chain failed.
    pub const POOL_UNAVAILABLE: i32 = -32000;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn queue_full() -> Self {
        Self::new(Self::UNKNOWN, "proxy queue full")
    }

    pub fn method_not_supported(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("method '{}' not supported by proxy", method))
    }

    pub fn pool_unavailable(coin: &str, tried: usize) -> Self {
        Self {
            code: Self::POOL_UNAVAILABLE,
            message: format!("all {} pools for {} are unreachable", tried, coin),
            data: Some(serde_json::json!({ "coin": coin, "tried": tried })),
        }
    }
}
