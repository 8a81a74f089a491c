use rumqttc::QoS;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParameterError {
    #[error("Parameters must be a mapping.")]
    NotAMapping,
    #[error("Parameter '{0}' is missing.")]
    Missing(&'static str),
    #[error("Parameter '{0}' is invalid: {1}")]
    Invalid(&'static str, String),
}

/// Options of a single topic import (remote broker -> local hub).
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTopicParameters {
    pub server: String,
    pub port: u16,
    pub topic: String,
    pub qos: QoS,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

impl ImportTopicParameters {
    pub fn new(server: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port,
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            use_tls: false,
            username: None,
            password: None,
            client_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Reads the parameters from a script supplied mapping.
    pub fn from_value(value: &Value) -> Result<Self, ParameterError> {
        let map = value.as_object().ok_or(ParameterError::NotAMapping)?;

        let server = required_string(map, "server")?;
        let topic = required_string(map, "topic")?;

        let mut parameters = Self::new(server, optional_port(map)?, topic);
        parameters.qos = optional_qos(map)?;
        parameters.use_tls = optional_bool(map, "tls")?.unwrap_or(false);
        parameters.username = optional_string(map, "username")?;
        parameters.password = optional_string(map, "password")?;
        if let Some(client_id) = optional_client_id(map)? {
            parameters.client_id = client_id;
        }

        Ok(parameters)
    }
}

/// A message published into the local hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishParameters {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishParameters {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, ParameterError> {
        let map = value.as_object().ok_or(ParameterError::NotAMapping)?;

        Ok(Self {
            topic: required_string(map, "topic")?,
            payload: optional_payload(map)?,
            qos: optional_qos(map)?,
            retain: optional_bool(map, "retain")?.unwrap_or(false),
        })
    }
}

pub const DEFAULT_EXTERNAL_PUBLISH_TIMEOUT: Duration = Duration::from_millis(5000);

/// A one-shot publish to a broker other than the local hub.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalPublishParameters {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub use_tls: bool,
    pub timeout: Duration,
    pub message: PublishParameters,
}

impl ExternalPublishParameters {
    pub fn new(server: impl Into<String>, port: u16, message: PublishParameters) -> Self {
        Self {
            server: server.into(),
            port,
            username: None,
            password: None,
            client_id: Uuid::new_v4().simple().to_string(),
            use_tls: false,
            timeout: DEFAULT_EXTERNAL_PUBLISH_TIMEOUT,
            message,
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, ParameterError> {
        let map = value.as_object().ok_or(ParameterError::NotAMapping)?;

        let server = required_string(map, "server")?;
        let mut parameters = Self::new(server, optional_port(map)?, PublishParameters::from_value(value)?);
        parameters.username = optional_string(map, "username")?;
        parameters.password = optional_string(map, "password")?;
        parameters.use_tls = optional_bool(map, "tls")?.unwrap_or(false);
        if let Some(client_id) = optional_client_id(map)? {
            parameters.client_id = client_id;
        }
        match map.get("timeout") {
            None | Some(Value::Null) => {}
            Some(timeout) => {
                let millis = timeout.as_u64().filter(|ms| *ms > 0).ok_or_else(|| {
                    ParameterError::Invalid("timeout", format!("expected milliseconds, got {}", timeout))
                })?;
                parameters.timeout = Duration::from_millis(millis);
            }
        }

        Ok(parameters)
    }
}

/// A message as delivered to hub subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub client_id: Option<String>,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl From<PublishParameters> for IncomingMessage {
    fn from(p: PublishParameters) -> Self {
        Self {
            client_id: None,
            topic: p.topic,
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
        }
    }
}

pub fn qos_from_level(level: u64) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

fn required_string(map: &Map<String, Value>, key: &'static str) -> Result<String, ParameterError> {
    match map.get(key) {
        None | Some(Value::Null) => Err(ParameterError::Missing(key)),
        Some(Value::String(s)) if s.is_empty() => {
            Err(ParameterError::Invalid(key, "must not be empty".to_string()))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ParameterError::Invalid(key, format!("expected a string, got {}", other))),
    }
}

fn optional_string(
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, ParameterError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ParameterError::Invalid(key, format!("expected a string, got {}", other))),
    }
}

fn optional_bool(map: &Map<String, Value>, key: &'static str) -> Result<Option<bool>, ParameterError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ParameterError::Invalid(key, format!("expected a bool, got {}", other))),
    }
}

fn optional_port(map: &Map<String, Value>) -> Result<u16, ParameterError> {
    match map.get("port") {
        None | Some(Value::Null) => Ok(DEFAULT_MQTT_PORT),
        Some(port) => port
            .as_u64()
            .filter(|p| (1..=u16::MAX as u64).contains(p))
            .map(|p| p as u16)
            .ok_or_else(|| ParameterError::Invalid("port", format!("expected 1-65535, got {}", port))),
    }
}

fn optional_client_id(map: &Map<String, Value>) -> Result<Option<String>, ParameterError> {
    let client_id = optional_string(map, "client_id")?;
    // rumqttc rejects empty ids and ids with a leading space.
    if let Some(id) = &client_id {
        if id.is_empty() || id.starts_with(' ') {
            return Err(ParameterError::Invalid(
                "client_id",
                "must not be empty or start with a space".to_string(),
            ));
        }
    }
    Ok(client_id)
}

fn optional_payload(map: &Map<String, Value>) -> Result<Vec<u8>, ParameterError> {
    match map.get("payload") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(text)) => Ok(text.as_bytes().to_vec()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .filter(|b| *b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| ParameterError::Invalid("payload", format!("{} is not a byte", item)))
            })
            .collect(),
        Some(other) => Err(ParameterError::Invalid(
            "payload",
            format!("unsupported payload format '{}'", other),
        )),
    }
}

fn optional_qos(map: &Map<String, Value>) -> Result<QoS, ParameterError> {
    match map.get("qos") {
        None | Some(Value::Null) => Ok(QoS::AtMostOnce),
        Some(level) => level
            .as_u64()
            .and_then(qos_from_level)
            .ok_or_else(|| ParameterError::Invalid("qos", format!("expected 0, 1 or 2, got {}", level))),
    }
}
