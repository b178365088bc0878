// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! `BaseEvent<T>` is the JSON envelope carried by every message. The transport
//! treats `data` as opaque; the remaining fields identify the event, drive topic
//! routing and link causal chains across services.

use crate::errors::EventHubError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Envelope fields that must be present and non-empty strings on the wire.
const REQUIRED_STRING_FIELDS: [&str; 5] = ["id", "type", "version", "timestamp", "source"];

/// Optional free-form metadata attached to an event.
///
/// Well-known keys are typed; anything else is kept in `extra` and survives a
/// JSON round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Message priority, 0 (lowest) to 9.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Time-to-live in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EventMetadata {
    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_owned(), value);
        self
    }

    /// Flattens the metadata into the JSON object it serializes to.
    pub(crate) fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// The wire envelope for every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent<T> {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl<T> BaseEvent<T> {
    /// Creates an envelope with a fresh id and the current time.
    pub fn new(event_type: &str, version: &str, source: &str, data: T) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_owned(),
            version: version.to_owned(),
            timestamp: Utc::now(),
            source: source.to_owned(),
            correlation_id: None,
            causation_id: None,
            data,
            metadata: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<EventMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Checks the required-field invariants of the envelope.
    pub fn validate(&self) -> Result<(), EventHubError> {
        let fields = [
            ("id", &self.id),
            ("type", &self.event_type),
            ("version", &self.version),
            ("source", &self.source),
        ];

        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(EventHubError::InvalidEvent(format!(
                "field `{name}` must not be empty"
            ))),
            None => Ok(()),
        }
    }
}

impl<T: DeserializeOwned> BaseEvent<T> {
    /// Decodes and validates an envelope from a message body.
    ///
    /// Malformed JSON is a [`EventHubError::ParsePayloadError`]; a missing or
    /// empty required field is an [`EventHubError::InvalidEvent`].
    pub fn from_slice(body: &[u8]) -> Result<Self, EventHubError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|err| EventHubError::ParsePayloadError(err.to_string()))?;

        validate_envelope(&raw)?;

        serde_json::from_value(raw).map_err(|err| EventHubError::ParsePayloadError(err.to_string()))
    }
}

impl<T: Serialize> BaseEvent<T> {
    pub fn to_vec(&self) -> Result<Vec<u8>, EventHubError> {
        serde_json::to_vec(self).map_err(|err| EventHubError::SerializationError(err.to_string()))
    }
}

fn validate_envelope(raw: &Value) -> Result<(), EventHubError> {
    let Some(object) = raw.as_object() else {
        return Err(EventHubError::InvalidEvent(
            "envelope is not a JSON object".to_owned(),
        ));
    };

    for field in REQUIRED_STRING_FIELDS {
        match object.get(field).and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(EventHubError::InvalidEvent(format!(
                    "missing required field `{field}`"
                )))
            }
        }
    }

    // null is a valid payload, an absent key is not
    if !object.contains_key("data") {
        return Err(EventHubError::InvalidEvent(
            "missing required field `data`".to_owned(),
        ));
    }

    Ok(())
}
