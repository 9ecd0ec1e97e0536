use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::record::{MessageType, WireRecord};
use crate::capability::{Capability, CapabilitySet};
use crate::device::AccessMode;
use crate::error::{AimError, Result};

/// Audit lines returned when a request does not say how many.
pub const DEFAULT_AUDIT_COUNT: usize = 50;

/// Value of the `REQTYPE` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Authenticate,
    Open,
    Control,
    Elevate,
    Drop,
    Check,
    Status,
    Audit,
    Close,
}

impl RequestType {
    pub const ALL: [RequestType; 9] = [
        RequestType::Authenticate,
        RequestType::Open,
        RequestType::Control,
        RequestType::Elevate,
        RequestType::Drop,
        RequestType::Check,
        RequestType::Status,
        RequestType::Audit,
        RequestType::Close,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Authenticate => "AUTHENTICATE",
            RequestType::Open => "OPEN",
            RequestType::Control => "CONTROL",
            RequestType::Elevate => "ELEVATE",
            RequestType::Drop => "DROP",
            RequestType::Check => "CHECK",
            RequestType::Status => "STATUS",
            RequestType::Audit => "AUDIT",
            RequestType::Close => "CLOSE",
        }
    }
}

impl FromStr for RequestType {
    type Err = AimError;

    fn from_str(s: &str) -> Result<Self> {
        RequestType::ALL
            .iter()
            .copied()
            .find(|reqtype| reqtype.as_str() == s)
            .ok_or_else(|| AimError::InvalidOperation(format!("unknown request type: {}", s)))
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Authenticate {
        app_name: String,
        fingerprint: String,
    },
    /// `target_pid == 0` addresses the caller itself.
    Elevate {
        target_pid: i32,
        flags: CapabilitySet,
        duration_secs: Option<i64>,
    },
    Drop {
        target_pid: i32,
        flag: Capability,
    },
    Check {
        target_pid: i32,
        flags: CapabilitySet,
    },
    Open {
        device: String,
        mode: AccessMode,
    },
    Control {
        device: String,
        command: String,
        params: BTreeMap<String, String>,
    },
    Status,
    Audit {
        count: usize,
    },
    /// Without a token the session ends; with one, that handle is released.
    Close {
        handle_token: Option<String>,
    },
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Authenticate { .. } => RequestType::Authenticate,
            Request::Elevate { .. } => RequestType::Elevate,
            Request::Drop { .. } => RequestType::Drop,
            Request::Check { .. } => RequestType::Check,
            Request::Open { .. } => RequestType::Open,
            Request::Control { .. } => RequestType::Control,
            Request::Status => RequestType::Status,
            Request::Audit { .. } => RequestType::Audit,
            Request::Close { .. } => RequestType::Close,
        }
    }
}

/// Request plus the envelope fields every request may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Client correlation token, echoed in the response.
    pub id: Option<String>,
    /// Pid the client claims to be; must match socket credentials.
    pub pid: Option<i32>,
    pub request: Request,
}

fn parse_pid(value: &str, key: &str) -> Result<i32> {
    value
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid >= 0)
        .ok_or_else(|| AimError::InvalidOperation(format!("invalid {}: {}", key, value)))
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: None,
            pid: None,
            request,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Decode a REQUEST record.
    pub fn from_record(record: &WireRecord) -> Result<Self> {
        if record.kind != MessageType::Request {
            return Err(AimError::InvalidOperation(format!(
                "expected REQUEST, got {}",
                record.kind
            )));
        }
        let reqtype = record
            .reqtype
            .ok_or_else(|| AimError::InvalidOperation("missing REQTYPE".to_string()))?;

        let request = match reqtype {
            RequestType::Authenticate => Request::Authenticate {
                app_name: record.require("app_name")?.to_string(),
                fingerprint: record.require("fingerprint")?.to_string(),
            },
            RequestType::Elevate => Request::Elevate {
                target_pid: parse_pid(record.require("target_pid")?, "target_pid")?,
                flags: CapabilitySet::parse(record.require("flags")?)?,
                duration_secs: match record.get("duration").map(str::trim) {
                    None | Some("") => None,
                    Some(value) => Some(value.parse::<i64>().map_err(|_| {
                        AimError::InvalidOperation(format!("invalid duration: {}", value))
                    })?),
                },
            },
            RequestType::Drop => Request::Drop {
                target_pid: parse_pid(record.require("target_pid")?, "target_pid")?,
                flag: record.require("flag")?.parse()?,
            },
            RequestType::Check => Request::Check {
                target_pid: parse_pid(record.require("target_pid")?, "target_pid")?,
                flags: CapabilitySet::parse(record.require("flag")?)?,
            },
            RequestType::Open => Request::Open {
                device: record.require("device")?.to_string(),
                mode: record.require("mode")?.parse()?,
            },
            RequestType::Control => Request::Control {
                device: record.require("device")?.to_string(),
                command: record.require("command")?.to_string(),
                params: record
                    .data
                    .iter()
                    .filter(|(key, _)| !matches!(key.as_str(), "device" | "command" | "pid"))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            },
            RequestType::Status => Request::Status,
            RequestType::Audit => Request::Audit {
                count: match record.get("count").map(str::trim) {
                    None | Some("") => DEFAULT_AUDIT_COUNT,
                    Some(value) => value.parse::<usize>().map_err(|_| {
                        AimError::InvalidOperation(format!("invalid count: {}", value))
                    })?,
                },
            },
            RequestType::Close => Request::Close {
                handle_token: record.get("handle_token").map(str::to_string),
            },
        };

        let pid = match record.get("pid") {
            Some(value) => Some(parse_pid(value, "pid")?),
            None => None,
        };

        Ok(Self {
            id: record.id.clone(),
            pid,
            request,
        })
    }

    /// Encode as a REQUEST record.
    pub fn to_record(&self) -> WireRecord {
        let mut record = WireRecord::new(MessageType::Request);
        record.reqtype = Some(self.request.request_type());
        record.id = self.id.clone();
        if let Some(pid) = self.pid {
            record.data.insert("pid".to_string(), pid.to_string());
        }

        let data = &mut record.data;
        match &self.request {
            Request::Authenticate {
                app_name,
                fingerprint,
            } => {
                data.insert("app_name".to_string(), app_name.clone());
                data.insert("fingerprint".to_string(), fingerprint.clone());
            }
            Request::Elevate {
                target_pid,
                flags,
                duration_secs,
            } => {
                data.insert("target_pid".to_string(), target_pid.to_string());
                data.insert("flags".to_string(), flags.to_string());
                data.insert(
                    "duration".to_string(),
                    duration_secs.map(|d| d.to_string()).unwrap_or_default(),
                );
            }
            Request::Drop { target_pid, flag } => {
                data.insert("target_pid".to_string(), target_pid.to_string());
                data.insert("flag".to_string(), flag.to_string());
            }
            Request::Check { target_pid, flags } => {
                data.insert("target_pid".to_string(), target_pid.to_string());
                data.insert("flag".to_string(), flags.to_string());
            }
            Request::Open { device, mode } => {
                data.insert("device".to_string(), device.clone());
                data.insert("mode".to_string(), mode.to_string());
            }
            Request::Control {
                device,
                command,
                params,
            } => {
                for (key, value) in params {
                    data.insert(key.clone(), value.clone());
                }
                data.insert("device".to_string(), device.clone());
                data.insert("command".to_string(), command.clone());
            }
            Request::Status => {}
            Request::Audit { count } => {
                data.insert("count".to_string(), count.to_string());
            }
            Request::Close { handle_token } => {
                if let Some(token) = handle_token {
                    data.insert("handle_token".to_string(), token.clone());
                }
            }
        }
        record
    }
}

/// A reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub reqtype: Option<RequestType>,
    pub id: Option<String>,
    pub success: bool,
    /// Wire error code when `success` is false.
    pub error: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl Response {
    pub fn ok(reqtype: RequestType, id: Option<String>) -> Self {
        Self {
            reqtype: Some(reqtype),
            id,
            success: true,
            error: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }

    pub fn failure(reqtype: Option<RequestType>, id: Option<String>, err: &AimError) -> Self {
        let mut data = BTreeMap::new();
        data.insert("message".to_string(), err.client_message());
        Self {
            reqtype,
            id,
            success: false,
            error: Some(err.code().to_string()),
            data,
        }
    }

    /// Human-readable message of a failed response.
    pub fn message(&self) -> Option<&str> {
        self.data.get("message").map(String::as_str)
    }

    pub fn to_record(&self) -> WireRecord {
        WireRecord {
            kind: if self.success {
                MessageType::Response
            } else {
                MessageType::Error
            },
            reqtype: self.reqtype,
            id: self.id.clone(),
            success: Some(self.success),
            error: self.error.clone(),
            data: self.data.clone(),
        }
    }

    pub fn from_record(record: &WireRecord) -> Result<Self> {
        let success = match record.kind {
            MessageType::Response => record.success.unwrap_or(true),
            MessageType::Error => false,
            other => {
                return Err(AimError::InvalidOperation(format!(
                    "expected RESPONSE or ERROR, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            reqtype: record.reqtype,
            id: record.id.clone(),
            success,
            error: record.error.clone(),
            data: record.data.clone(),
        })
    }
}
