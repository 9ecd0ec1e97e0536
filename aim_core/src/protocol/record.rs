use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::message::RequestType;
use crate::error::{AimError, Result};

/// Value of the `TYPE` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Event => "EVENT",
            MessageType::Error => "ERROR",
        }
    }
}

impl FromStr for MessageType {
    type Err = AimError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REQUEST" => Ok(MessageType::Request),
            "RESPONSE" => Ok(MessageType::Response),
            "EVENT" => Ok(MessageType::Event),
            "ERROR" => Ok(MessageType::Error),
            other => Err(AimError::InvalidOperation(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped payload record: the fields of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub kind: MessageType,
    pub reqtype: Option<RequestType>,
    pub id: Option<String>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub data: BTreeMap<String, String>,
}

impl WireRecord {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            reqtype: None,
            id: None,
            success: None,
            error: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Required DATA value, or `invalid_operation`.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| AimError::InvalidOperation(format!("missing field: {}", key)))
    }

    /// Parse a payload. Later occurrences of a key replace earlier ones.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| AimError::InvalidMessage(format!("payload is not UTF-8: {}", e)))?;

        let mut kind = None;
        let mut reqtype = None;
        let mut id = None;
        let mut success = None;
        let mut error = None;
        let mut data = BTreeMap::new();

        for line in text.split('\n').filter(|line| !line.is_empty()) {
            let (key, value) = line.split_once(':').ok_or_else(|| {
                AimError::InvalidMessage(format!("line without ':' separator: {:?}", line))
            })?;
            match key {
                "TYPE" => kind = Some(value.parse::<MessageType>()?),
                "REQTYPE" => reqtype = Some(value.parse::<RequestType>()?),
                "ID" => id = Some(unescape(value)),
                "SUCCESS" => {
                    success = Some(match value {
                        "1" => true,
                        "0" => false,
                        other => {
                            return Err(AimError::InvalidOperation(format!(
                                "SUCCESS must be 0 or 1, got {}",
                                other
                            )))
                        }
                    })
                }
                "ERROR" => error = Some(unescape(value)),
                "DATA" => {
                    let (k, v) = value.split_once('=').ok_or_else(|| {
                        AimError::InvalidMessage(format!("DATA without '=': {:?}", value))
                    })?;
                    if k.is_empty() {
                        return Err(AimError::InvalidMessage("DATA with empty key".to_string()));
                    }
                    data.insert(k.to_string(), unescape(v));
                }
                _ => {}
            }
        }

        Ok(Self {
            kind: kind.ok_or_else(|| AimError::InvalidOperation("missing TYPE".to_string()))?,
            reqtype,
            id,
            success,
            error,
            data,
        })
    }

    /// Serialize in canonical order: TYPE, REQTYPE, ID, SUCCESS, ERROR,
    /// then DATA sorted by key.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("TYPE:{}\n", self.kind));
        if let Some(reqtype) = self.reqtype {
            out.push_str(&format!("REQTYPE:{}\n", reqtype));
        }
        if let Some(id) = &self.id {
            out.push_str(&format!("ID:{}\n", escape(id)));
        }
        if let Some(success) = self.success {
            out.push_str(if success { "SUCCESS:1\n" } else { "SUCCESS:0\n" });
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("ERROR:{}\n", escape(error)));
        }
        for (key, value) in &self.data {
            out.push_str(&format!("DATA:{}={}\n", key, escape(value)));
        }
        out.into_bytes()
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_request() {
        let payload = b"TYPE:REQUEST\nREQTYPE:OPEN\nID:42\nDATA:device=null\nDATA:mode=r\n";
        let record = WireRecord::parse(payload).unwrap();
        assert_eq!(record.kind, MessageType::Request);
        assert_eq!(record.reqtype, Some(RequestType::Open));
        assert_eq!(record.id.as_deref(), Some("42"));
        assert_eq!(record.get("device"), Some("null"));
        assert_eq!(record.get("mode"), Some("r"));
    }

    #[test]
    fn test_field_order_irrelevant_and_last_wins() {
        let payload = b"DATA:mode=r\nID:1\nTYPE:REQUEST\nDATA:mode=w\nID:2\nREQTYPE:OPEN\n";
        let record = WireRecord::parse(payload).unwrap();
        assert_eq!(record.id.as_deref(), Some("2"));
        assert_eq!(record.get("mode"), Some("w"));
    }

    #[test]
    fn test_value_may_contain_separators() {
        let record = WireRecord::parse(b"TYPE:EVENT\nDATA:url=unix:/run/x=1\n").unwrap();
        assert_eq!(record.get("url"), Some("unix:/run/x=1"));
    }

    #[test]
    fn test_multiline_values_escape() {
        let record = WireRecord::new(MessageType::Response)
            .with_data("audit_text", "[t] OPEN_OK 1 a\\b\n[t] DROP 2 c\n");
        let bytes = record.serialize();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 2);
        assert_eq!(WireRecord::parse(&bytes).unwrap(), record);
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(
            WireRecord::parse(&[0xff, 0xfe]).unwrap_err().code(),
            "invalid_message"
        );
        assert_eq!(
            WireRecord::parse(b"TYPE:REQUEST\ngarbage\n").unwrap_err().code(),
            "invalid_message"
        );
        assert_eq!(
            WireRecord::parse(b"TYPE:REQUEST\nDATA:novalue\n").unwrap_err().code(),
            "invalid_message"
        );
        assert_eq!(
            WireRecord::parse(b"REQTYPE:OPEN\n").unwrap_err().code(),
            "invalid_operation"
        );
        assert_eq!(
            WireRecord::parse(b"TYPE:REQUEST\nREQTYPE:FORMAT\n").unwrap_err().code(),
            "invalid_operation"
        );
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let record = WireRecord::parse(b"TYPE:REQUEST\nREQTYPE:STATUS\nX-TRACE:abc\n").unwrap();
        assert_eq!(record.reqtype, Some(RequestType::Status));
    }

    fn reqtype() -> impl Strategy<Value = Option<RequestType>> {
        proptest::option::of(proptest::sample::select(RequestType::ALL.to_vec()))
    }

    fn kind() -> impl Strategy<Value = MessageType> {
        proptest::sample::select(vec![
            MessageType::Request,
            MessageType::Response,
            MessageType::Event,
            MessageType::Error,
        ])
    }

    proptest! {
        #[test]
        fn prop_canonical_records_round_trip(
            kind in kind(),
            reqtype in reqtype(),
            id in proptest::option::of("[ -~]{0,16}"),
            success in proptest::option::of(any::<bool>()),
            error in proptest::option::of("[ -~\n]{0,32}"),
            data in proptest::collection::btree_map("[a-z_]{1,12}", "[ -~\n]{0,32}", 0..6),
        ) {
            let record = WireRecord { kind, reqtype, id, success, error, data };
            let bytes = record.serialize();
            let parsed = WireRecord::parse(&bytes).unwrap();
            prop_assert_eq!(&parsed, &record);
            prop_assert_eq!(parsed.serialize(), bytes);
        }
    }
}
