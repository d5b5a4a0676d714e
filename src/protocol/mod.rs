use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";
/// The engine never correlates AutoPoll replies, so one fixed id is used.
pub const AUTO_POLL_REQUEST_ID: u32 = 1234;

pub const METHOD_LOGON: &str = "Logon";
pub const METHOD_NO_OP: &str = "NoOp";
pub const METHOD_AUTO_POLL: &str = "ChangeGroup.AutoPoll";
pub const METHOD_ENGINE_STATUS: &str = "EngineStatus";
pub const METHOD_CHANGE_GROUP_POLL: &str = "ChangeGroup.Poll";

#[derive(Debug, Clone, Serialize)]
pub struct Request<P> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub method: &'static str,
    pub params: P,
}

impl<P> Request<P> {
    fn new(method: &'static str, id: Option<u32>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogonParams {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NoOpParams {}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AutoPollParams {
    pub id: String,
    pub rate: f64,
}

pub fn logon_request(user: &str, password: &str) -> Request<LogonParams> {
    Request::new(
        METHOD_LOGON,
        None,
        LogonParams {
            user: user.to_string(),
            password: password.to_string(),
        },
    )
}

pub fn no_op_request() -> Request<NoOpParams> {
    Request::new(METHOD_NO_OP, None, NoOpParams::default())
}

pub fn auto_poll_request(group_id: &str, rate_seconds: f64) -> Request<AutoPollParams> {
    Request::new(
        METHOD_AUTO_POLL,
        Some(AUTO_POLL_REQUEST_ID),
        AutoPollParams {
            id: group_id.to_string(),
            rate: rate_seconds,
        },
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum EngineState {
    Active,
    Standby,
    Idle,
    Other(String),
}

impl From<String> for EngineState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Active" => Self::Active,
            "Standby" => Self::Standby,
            "Idle" => Self::Idle,
            _ => Self::Other(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineStatus {
    pub state: EngineState,
    #[serde(default)]
    pub design_name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub is_redundant: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeGroupPoll {
    #[serde(default)]
    pub id: Option<String>,
    pub changes: Vec<Value>,
}

/// The inbound notifications this client understands. Anything else is
/// kept as `Unrecognized` and dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    EngineStatus(EngineStatus),
    ChangeGroupPoll(ChangeGroupPoll),
    Unrecognized(String),
}

#[derive(Debug)]
pub enum DispatchError {
    MethodNotString(Value),
    InvalidParams {
        method: &'static str,
        source: serde_json::Error,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MethodNotString(value) => write!(f, "method field is not a string: {value}"),
            Self::InvalidParams { method, source } => {
                write!(f, "invalid params for {method}: {source}")
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MethodNotString(_) => None,
            Self::InvalidParams { source, .. } => Some(source),
        }
    }
}

/// Returns `Ok(None)` for objects without a `method` field.
pub fn parse_inbound(frame: Value) -> Result<Option<InboundMessage>, DispatchError> {
    let Value::Object(mut object) = frame else {
        return Ok(None);
    };
    let method = match object.remove("method") {
        None => return Ok(None),
        Some(Value::String(method)) => method,
        Some(other) => return Err(DispatchError::MethodNotString(other)),
    };
    let params = object.remove("params").unwrap_or(Value::Null);

    let message = match method.as_str() {
        METHOD_ENGINE_STATUS => {
            InboundMessage::EngineStatus(decode_params(METHOD_ENGINE_STATUS, params)?)
        }
        METHOD_CHANGE_GROUP_POLL => {
            InboundMessage::ChangeGroupPoll(decode_params(METHOD_CHANGE_GROUP_POLL, params)?)
        }
        _ => InboundMessage::Unrecognized(method),
    };
    Ok(Some(message))
}

fn decode_params<T: for<'de> Deserialize<'de>>(
    method: &'static str,
    params: Value,
) -> Result<T, DispatchError> {
    serde_json::from_value(params).map_err(|source| DispatchError::InvalidParams { method, source })
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Ready,
    StandbyDetected,
    ChangeNotified(Value),
}

#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    redundancy_enabled: bool,
}

impl Dispatcher {
    pub fn new(redundancy_enabled: bool) -> Self {
        Self { redundancy_enabled }
    }

    pub fn dispatch(&self, frame: Value) -> Result<Vec<DispatchEvent>, DispatchError> {
        let message = match parse_inbound(frame)? {
            Some(message) => message,
            None => return Ok(Vec::new()),
        };
        Ok(self.route(message))
    }

    pub fn route(&self, message: InboundMessage) -> Vec<DispatchEvent> {
        match message {
            InboundMessage::EngineStatus(status) => match status.state {
                EngineState::Active => vec![DispatchEvent::Ready],
                EngineState::Standby if self.redundancy_enabled => {
                    vec![DispatchEvent::StandbyDetected]
                }
                _ => Vec::new(),
            },
            InboundMessage::ChangeGroupPoll(poll) => poll
                .changes
                .into_iter()
                .map(DispatchEvent::ChangeNotified)
                .collect(),
            InboundMessage::Unrecognized(method) => {
                tracing::trace!(method = %method, "ignoring unrecognized inbound method");
                Vec::new()
            }
        }
    }
}
