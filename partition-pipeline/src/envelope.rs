//! Message envelope and the helpers used to build requests and replies.
//!
//! Envelopes travel as JSON. The payload is kept as a raw JSON value tagged with its
//! [`MessageType`] so that a consumer can pick the matching parser from the
//! [`TypeDictionary`](crate::dictionary::TypeDictionary) without knowing every type up front.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnvelopeError;

/// A named destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identity of a payload type, used as the dictionary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn of<P: Payload>() -> Self {
        P::message_type()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A type that can travel inside an envelope.
///
/// `NAME` is the wire identity of the payload. Every service producing or consuming it
/// must declare the same name, so it has to stay fixed once messages are in flight.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn message_type() -> MessageType {
        MessageType::new(Self::NAME)
    }
}

/// Trace and correlation data carried from a request to everything it causes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baggage: BTreeMap<String, String>,
}

impl TraceContext {
    /// Start a new trace
    pub fn new_trace() -> Self {
        Self {
            trace_id: Some(Uuid::now_v7()),
            ..Default::default()
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Topic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub context: TraceContext,
    pub message_type: MessageType,
    pub sent_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new<P: Payload>(
        topic: Topic,
        key: Option<String>,
        payload: &P,
        context: TraceContext,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            id: Uuid::now_v7(),
            topic,
            reply_to: None,
            key,
            context,
            message_type: P::message_type(),
            sent_at: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn key_bytes(&self) -> Option<&[u8]> {
        self.key.as_deref().map(str::as_bytes)
    }

    /// Decode the payload as `P`, ignoring the type tag
    pub fn payload_as<P: Payload>(&self) -> Result<P, EnvelopeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Build a request whose handler is expected to answer on `reply_to`
pub fn request_for<P: Payload>(
    topic: &Topic,
    reply_to: &Topic,
    key: Option<String>,
    payload: &P,
    context: TraceContext,
) -> Result<Message, EnvelopeError> {
    let mut message = Message::new(topic.clone(), key, payload, context)?;
    message.reply_to = Some(reply_to.clone());
    Ok(message)
}

/// Build the reply to `original`.
///
/// The reply goes to the original's reply-to topic with the original key, so it lands
/// on the same partition as other replies for that key. It is correlated to the
/// original message id unless `context` already names a correlation id.
pub fn reply_to<P: Payload>(
    original: &Message,
    payload: &P,
    context: TraceContext,
) -> Result<Message, EnvelopeError> {
    let destination = original
        .reply_to
        .clone()
        .ok_or(EnvelopeError::MissingReplyTo {
            message_id: original.id,
        })?;

    let mut context = context;
    if context.trace_id.is_none() {
        context.trace_id = original.context.trace_id;
    }
    context.correlation_id = context.correlation_id.or(Some(original.id));

    Message::new(destination, original.key.clone(), payload, context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        sequence: u32,
    }

    impl Payload for Ping {
        const NAME: &'static str = "ping.v1";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        sequence: u32,
    }

    impl Payload for Pong {
        const NAME: &'static str = "pong.v1";
    }

    #[test]
    fn test_message_type_is_the_declared_name() {
        assert_eq!(MessageType::of::<Ping>().as_str(), "ping.v1");
        assert_eq!(MessageType::of::<Pong>().as_str(), "pong.v1");

        let message = Message::new(
            Topic::new("pings"),
            None,
            &Ping { sequence: 1 },
            TraceContext::default(),
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(json["message_type"], "ping.v1");
    }

    #[test]
    fn test_envelope_wire_format() {
        let message = Message::new(
            Topic::new("pings"),
            Some("account-42".to_string()),
            &Ping { sequence: 7 },
            TraceContext::new_trace(),
        )
        .unwrap();

        let bytes = message.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["topic"], "pings");
        assert_eq!(json["key"], "account-42");
        assert_eq!(json["payload"]["sequence"], 7);
        assert!(json.get("reply_to").is_none());

        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.payload_as::<Ping>().unwrap(), Ping { sequence: 7 });
        assert_eq!(decoded.key_bytes(), Some("account-42".as_bytes()));
    }

    #[test]
    fn test_malformed_envelope_is_rejected() {
        assert!(Message::from_bytes(b"not json").is_err());
        assert!(Message::from_bytes(br#"{"id": "nope"}"#).is_err());
    }

    #[test]
    fn test_reply_goes_to_reply_topic_with_original_key() {
        let context = TraceContext::new_trace().with_baggage("tenant", "acme");
        let request = request_for(
            &Topic::new("pings"),
            &Topic::new("pongs"),
            Some("account-42".to_string()),
            &Ping { sequence: 1 },
            context.clone(),
        )
        .unwrap();
        assert_eq!(request.reply_to, Some(Topic::new("pongs")));

        let reply = reply_to(&request, &Pong { sequence: 1 }, TraceContext::default()).unwrap();
        assert_eq!(reply.topic, Topic::new("pongs"));
        assert_eq!(reply.key.as_deref(), Some("account-42"));
        assert_eq!(reply.reply_to, None);
        assert_eq!(reply.message_type, MessageType::new("pong.v1"));
        assert_eq!(reply.context.trace_id, context.trace_id);
        assert_eq!(reply.context.correlation_id, Some(request.id));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn test_reply_without_reply_topic_fails() {
        let message = Message::new(
            Topic::new("pings"),
            None,
            &Ping { sequence: 1 },
            TraceContext::default(),
        )
        .unwrap();

        let err = reply_to(&message, &Pong { sequence: 1 }, TraceContext::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingReplyTo { message_id } if message_id == message.id));
    }
}
