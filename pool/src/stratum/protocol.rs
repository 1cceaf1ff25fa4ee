/// Stratum protocol message types and request decoding
///
/// XMRig-style JSON-RPC: `login`, `submit`, `getjob`, `keepalived`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::jobs::Job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub jsonrpc: String,

    pub id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Always present on success replies, as `null`
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub const UNKNOWN: i32 = -1;

    pub const INVALID_LOGIN: &'static str = "Invalid login syntax";
    pub const INVALID_SUBMIT: &'static str = "Invalid share submission syntax";
    pub const INVALID_METHOD: &'static str = "Invalid method specified";
    pub const NOT_LOGGED_IN: &'static str = "Miner not logged in";
    pub const JOB_EXPIRED: &'static str = "Job expired.";
    pub const INVALID_SHARE: &'static str = "Invalid share detected. Check your algorithm and try again";
    pub const LOGIN_FAILED: &'static str = "Unknown Login failure";

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Self::UNKNOWN, message)
    }
}

/// Asynchronous job push
#[derive(Debug, Clone, Serialize)]
pub struct JobNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: &'a Job,
}

impl<'a> JobNotification<'a> {
    pub fn new(job: &'a Job) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "job",
            params: job,
        }
    }
}

pub fn login_result(connection_id: &str, job: &Job) -> Value {
    json!({ "id": connection_id, "job": job, "status": "OK" })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginParams {
    /// Wallet address with any `.worker` / `+difficulty` suffix removed
    pub login: String,
    pub pass: String,
    pub rig_id: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub id: String,
    pub job_id: String,
    pub nonce: u32,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StratumRequest {
    Login { id: Value, params: LoginParams },
    Submit { id: Value, params: SubmitParams },
    GetJob { id: Value },
    KeepAlive { id: Value },
}

impl StratumRequest {
    pub fn id(&self) -> &Value {
        match self {
            Self::Login { id, .. } | Self::Submit { id, .. } | Self::GetJob { id } | Self::KeepAlive { id } => id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::Submit { .. } => "submit",
            Self::GetJob { .. } => "getjob",
            Self::KeepAlive { .. } => "keepalived",
        }
    }
}

/// Outcome of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Request(StratumRequest),
    /// Malformed envelope; drop the connection without replying
    Violation(&'static str),
    /// Known method with bad params; reply with `message`, then hang up
    Invalid { id: Value, message: &'static str },
    /// Well-formed but unrecognized method
    UnknownMethod { id: Value, method: String },
}

/// Strip the `.rig` and `+difficulty` worker conventions from a login.
pub fn sanitize_login(login: &str) -> &str {
    let login = login.split('.').next().unwrap_or(login);
    login.split('+').next().unwrap_or(login)
}

/// Read a hex nonce as a little-endian u32 from its first 4 bytes.
pub fn parse_nonce(nonce: &str) -> Option<u32> {
    let bytes = hex::decode(nonce).ok()?;
    let word: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(word))
}

fn opt_string(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn decode_login(params: &Value) -> Option<LoginParams> {
    let login = params.get("login")?.as_str()?;
    let pass = params.get("pass")?.as_str()?;

    let login = sanitize_login(login);
    if login.is_empty() {
        return None;
    }

    Some(LoginParams {
        login: login.to_string(),
        pass: pass.to_string(),
        rig_id: opt_string(params, "rigid"),
        agent: opt_string(params, "agent"),
    })
}

fn decode_submit(params: &Value) -> Option<SubmitParams> {
    let field = |key: &str| params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string());

    let id = field("id")?;
    let job_id = field("job_id")?;
    let result = field("result")?;
    let nonce = parse_nonce(params.get("nonce")?.as_str()?)?;

    Some(SubmitParams {
        id,
        job_id,
        nonce,
        result,
    })
}

/// Validate the JSON-RPC envelope and decode a request.
pub fn decode(message: &Value) -> Decoded {
    let Some(obj) = message.as_object() else {
        return Decoded::Violation("message is not an object");
    };
    let Some(method) = obj.get("method").and_then(|m| m.as_str()) else {
        return Decoded::Violation("missing method");
    };
    let Some(params) = obj.get("params").filter(|p| p.is_object()) else {
        return Decoded::Violation("missing params");
    };
    let Some(id) = obj.get("id").cloned() else {
        return Decoded::Violation("missing id");
    };

    match method.to_ascii_lowercase().as_str() {
        "login" => match decode_login(params) {
            Some(params) => Decoded::Request(StratumRequest::Login { id, params }),
            None => Decoded::Invalid {
                id,
                message: StratumError::INVALID_LOGIN,
            },
        },
        "submit" => match decode_submit(params) {
            Some(params) => Decoded::Request(StratumRequest::Submit { id, params }),
            None => Decoded::Invalid {
                id,
                message: StratumError::INVALID_SUBMIT,
            },
        },
        "getjob" => Decoded::Request(StratumRequest::GetJob { id }),
        "keepalived" => Decoded::Request(StratumRequest::KeepAlive { id }),
        _ => Decoded::UnknownMethod {
            id,
            method: method.to_string(),
        },
    }
}
