//! Wire envelope, payloads and structural validation
//!
//! ```json
//! { "devices": ["<uuid>"], "topic": "RPC_CALL", "fromUuid": "<uuid>",
//!   "callbackId": "<uuid>", "payload": { "cmdName": "...", "cmdCode": "...", "parameters": {} } }
//! ```
//!
//! Validation never fails hard: a malformed document yields a
//! [`ValidationError`] naming the offending location, which the device turns
//! into a `200001` reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Success
pub const RET_OK: i64 = 200;
/// Envelope or payload failed validation
pub const RET_VALIDATION_FAILED: i64 = 200_001;
/// No reply within the message timeout
pub const RET_TIMEOUT: i64 = 200_003;
/// No handler registered for the command name
pub const RET_UNKNOWN_COMMAND: i64 = 200_004;

/// Recipient selector: one device or several
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    One(String),
    Many(Vec<String>),
}

impl Devices {
    /// Iterate over the selected uuids
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: &[String] = match self {
            Self::One(uuid) => std::slice::from_ref(uuid),
            Self::Many(uuids) => uuids,
        };
        items.iter().map(String::as_str)
    }
}

impl From<&str> for Devices {
    fn from(uuid: &str) -> Self {
        Self::One(uuid.to_string())
    }
}

impl From<String> for Devices {
    fn from(uuid: String) -> Self {
        Self::One(uuid)
    }
}

impl From<Vec<String>> for Devices {
    fn from(uuids: Vec<String>) -> Self {
        Self::Many(uuids)
    }
}

/// Envelope topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "RPC_CALL")]
    RpcCall,
    #[serde(rename = "RPC_BACK")]
    RpcBack,
}

impl Topic {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RpcCall => "RPC_CALL",
            Self::RpcBack => "RPC_BACK",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "RPC_CALL" => Some(Self::RpcCall),
            "RPC_BACK" => Some(Self::RpcBack),
            _ => None,
        }
    }
}

/// Unit of wire exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub devices: Devices,
    pub topic: Topic,
    pub from_uuid: String,
    /// Correlation id; absent for fire-and-forget calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    pub payload: Value,
}

impl Envelope {
    /// `RPC_CALL` envelope
    #[must_use]
    pub fn call(
        devices: impl Into<Devices>,
        from_uuid: impl Into<String>,
        callback_id: Option<String>,
        payload: &RpcCallPayload,
    ) -> Self {
        Self {
            devices: devices.into(),
            topic: Topic::RpcCall,
            from_uuid: from_uuid.into(),
            callback_id,
            payload: payload.to_value(),
        }
    }

    /// `RPC_BACK` envelope addressed to the original caller
    #[must_use]
    pub fn back(
        to: &str,
        from_uuid: impl Into<String>,
        callback_id: Option<String>,
        payload: &RpcBackPayload,
    ) -> Self {
        Self {
            devices: Devices::Many(vec![to.to_string()]),
            topic: Topic::RpcBack,
            from_uuid: from_uuid.into(),
            callback_id,
            payload: payload.to_value(),
        }
    }
}

/// Remote method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCallPayload {
    pub cmd_name: String,
    pub cmd_code: String,
    pub parameters: Value,
}

impl RpcCallPayload {
    #[must_use]
    pub fn new(cmd_name: impl Into<String>, cmd_code: impl Into<String>, parameters: Value) -> Self {
        Self {
            cmd_name: cmd_name.into(),
            cmd_code: cmd_code.into(),
            parameters,
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "cmdName": self.cmd_name,
            "cmdCode": self.cmd_code,
            "parameters": self.parameters,
        })
    }
}

/// Reply contract; `ret_code == 200` is success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBackPayload {
    pub ret_code: i64,
    pub description: String,
    pub data: Value,
}

impl RpcBackPayload {
    /// Successful reply carrying `data`
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            ret_code: RET_OK,
            description: "Success.".to_string(),
            data,
        }
    }

    /// Application error reply
    #[must_use]
    pub fn error(ret_code: i64, description: impl Into<String>) -> Self {
        Self {
            ret_code,
            description: description.into(),
            data: Value::Object(Map::new()),
        }
    }

    /// Synthetic reply for a call that ran out of time
    #[must_use]
    pub fn timeout(callback_id: &str, timeout_secs: f64) -> Self {
        Self::error(
            RET_TIMEOUT,
            format!("{callback_id},message listening time out:{timeout_secs}s"),
        )
    }

    /// Reply for a command name with no registered handler
    #[must_use]
    pub fn unknown_command(cmd_name: &str) -> Self {
        Self::error(RET_UNKNOWN_COMMAND, format!("method name={cmd_name}"))
    }

    /// Reply describing a validation failure
    #[must_use]
    pub fn validation(err: &ValidationError) -> Self {
        Self {
            ret_code: RET_VALIDATION_FAILED,
            description: err.message.clone(),
            data: json!({ "message": err.message, "dataPath": err.data_path }),
        }
    }

    /// Whether the reply reports success
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ret_code == RET_OK
    }

    fn to_value(&self) -> Value {
        json!({
            "retCode": self.ret_code,
            "description": self.description,
            "data": self.data,
        })
    }
}

/// Structural validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (at '{data_path}')")]
pub struct ValidationError {
    /// Human-readable reason
    pub message: String,
    /// JSON pointer to the failing location; empty for the document root
    pub data_path: String,
}

impl ValidationError {
    fn new(message: impl Into<String>, data_path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data_path: data_path.into(),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invalid_type(value: &Value, expected: &str, path: &str) -> ValidationError {
    ValidationError::new(
        format!("Invalid type: {} (expected {expected})", type_name(value)),
        path,
    )
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ValidationError> {
    value
        .as_object()
        .ok_or_else(|| invalid_type(value, "object", path))
}

fn required<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ValidationError> {
    obj.get(field)
        .ok_or_else(|| ValidationError::new(format!("Missing required property: {field}"), ""))
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, ValidationError> {
    let value = required(obj, field)?;
    value
        .as_str()
        .ok_or_else(|| invalid_type(value, "string", &format!("/{field}")))
}

/// Topic of a message if it has a recognizable one, even if otherwise malformed
#[must_use]
pub fn peek_topic(raw: &Value) -> Option<Topic> {
    raw.get("topic").and_then(Value::as_str).and_then(Topic::parse)
}

/// Validate the outer envelope
///
/// # Errors
///
/// Returns the first structural problem found
pub fn validate_envelope(raw: &Value) -> Result<Envelope, ValidationError> {
    let obj = as_object(raw, "")?;

    let devices = match required(obj, "devices")? {
        Value::String(uuid) => Devices::One(uuid.clone()),
        Value::Array(items) => Devices::Many(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.as_str()
                        .map(ToString::to_string)
                        .ok_or_else(|| invalid_type(item, "string", &format!("/devices/{i}")))
                })
                .collect::<Result<_, _>>()?,
        ),
        other => return Err(invalid_type(other, "string or array", "/devices")),
    };

    let topic = required_str(obj, "topic")?;
    let topic = Topic::parse(topic)
        .ok_or_else(|| ValidationError::new(format!("No enum match for: \"{topic}\""), "/topic"))?;

    let from_uuid = required_str(obj, "fromUuid")?.to_string();

    let callback_id = match obj.get("callbackId") {
        None => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(other) => return Err(invalid_type(other, "string", "/callbackId")),
    };

    let payload = required(obj, "payload")?;
    as_object(payload, "/payload")?;

    Ok(Envelope {
        devices,
        topic,
        from_uuid,
        callback_id,
        payload: payload.clone(),
    })
}

/// Validate an `RPC_CALL` payload
///
/// # Errors
///
/// Returns the first structural problem found
pub fn validate_call(payload: &Value) -> Result<RpcCallPayload, ValidationError> {
    let obj = as_object(payload, "")?;
    Ok(RpcCallPayload {
        cmd_name: required_str(obj, "cmdName")?.to_string(),
        cmd_code: required_str(obj, "cmdCode")?.to_string(),
        parameters: required(obj, "parameters")?.clone(),
    })
}

/// Validate an `RPC_BACK` payload
///
/// # Errors
///
/// Returns the first structural problem found
#[allow(clippy::cast_possible_truncation)]
pub fn validate_back(payload: &Value) -> Result<RpcBackPayload, ValidationError> {
    let obj = as_object(payload, "")?;

    let ret_code = required(obj, "retCode")?;
    let ret_code = ret_code
        .as_i64()
        .or_else(|| ret_code.as_f64().map(|f| f as i64))
        .ok_or_else(|| invalid_type(ret_code, "number", "/retCode"))?;

    Ok(RpcBackPayload {
        ret_code,
        description: required_str(obj, "description")?.to_string(),
        data: required(obj, "data")?.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_names() {
        let payload = RpcCallPayload::new("ping", "0001", json!({}));
        let envelope = Envelope::call("b", "a", Some("cb".to_string()), &payload);
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["topic"], "RPC_CALL");
        assert_eq!(wire["fromUuid"], "a");
        assert_eq!(wire["callbackId"], "cb");
        assert_eq!(wire["payload"]["cmdName"], "ping");
        assert_eq!(validate_envelope(&wire).unwrap(), envelope);
    }

    #[test]
    fn fire_and_forget_omits_callback_id() {
        let payload = RpcCallPayload::new("log", "0002", Value::Null);
        let wire = serde_json::to_value(Envelope::call("b", "a", None, &payload)).unwrap();
        assert!(wire.get("callbackId").is_none());
    }

    #[test]
    fn devices_accepts_string_or_array() {
        let one = validate_envelope(&json!({
            "devices": "x", "topic": "RPC_BACK", "fromUuid": "a", "payload": {}
        }))
        .unwrap();
        assert_eq!(one.devices.iter().collect::<Vec<_>>(), vec!["x"]);

        let many = validate_envelope(&json!({
            "devices": ["x", "y"], "topic": "RPC_BACK", "fromUuid": "a", "payload": {}
        }))
        .unwrap();
        assert_eq!(many.devices.iter().count(), 2);
    }

    #[test]
    fn envelope_errors_name_location() {
        let err = validate_envelope(&json!({
            "devices": ["x", 3], "topic": "RPC_CALL", "fromUuid": "a", "payload": {}
        }))
        .unwrap_err();
        assert_eq!(err.data_path, "/devices/1");

        let err = validate_envelope(&json!({
            "devices": "x", "topic": "RPC_PUSH", "fromUuid": "a", "payload": {}
        }))
        .unwrap_err();
        assert_eq!(err.data_path, "/topic");
        assert!(err.message.contains("RPC_PUSH"));

        let err = validate_envelope(&json!({
            "devices": "x", "topic": "RPC_CALL", "payload": {}
        }))
        .unwrap_err();
        assert_eq!(err.message, "Missing required property: fromUuid");

        let err = validate_envelope(&json!({
            "devices": "x", "topic": "RPC_CALL", "fromUuid": "a", "payload": []
        }))
        .unwrap_err();
        assert_eq!(err.data_path, "/payload");

        let err = validate_envelope(&json!("nope")).unwrap_err();
        assert_eq!(err.data_path, "");
    }

    #[test]
    fn call_payload_requires_parameters() {
        let err = validate_call(&json!({ "cmdName": "ping", "cmdCode": "1" })).unwrap_err();
        assert_eq!(err.message, "Missing required property: parameters");

        let call =
            validate_call(&json!({ "cmdName": "ping", "cmdCode": "1", "parameters": null }))
                .unwrap();
        assert_eq!(call.parameters, Value::Null);
    }

    #[test]
    fn back_payload_types() {
        let err = validate_back(&json!({ "retCode": "200", "description": "", "data": {} }))
            .unwrap_err();
        assert_eq!(err.data_path, "/retCode");

        let back = validate_back(&json!({ "retCode": 200, "description": "Success.", "data": [1] }))
            .unwrap();
        assert!(back.is_ok());
    }

    #[test]
    fn peek_topic_on_malformed() {
        assert_eq!(peek_topic(&json!({ "topic": "RPC_CALL" })), Some(Topic::RpcCall));
        assert_eq!(peek_topic(&json!({ "topic": 1 })), None);
    }

    #[test]
    fn validation_reply_carries_location() {
        let err = ValidationError::new("Missing required property: cmdCode", "");
        let reply = RpcBackPayload::validation(&err);
        assert_eq!(reply.ret_code, RET_VALIDATION_FAILED);
        assert_eq!(reply.data["dataPath"], "");
    }
}
