//! Classification of Cloud Storage notifications.
//!
//! Event type and bucket always come from the message attributes. The object
//! size is only available when the notification carries a JSON API object
//! resource as its payload.

use crate::subscription::NotificationMessage;
use serde::{Deserialize, Deserializer};

/// Attribute holding the notification event type
pub const EVENT_TYPE_ATTRIBUTE: &str = "eventType";
/// Attribute holding the bucket name
pub const BUCKET_ID_ATTRIBUTE: &str = "bucketId";
/// Attribute describing the payload encoding
pub const PAYLOAD_FORMAT_ATTRIBUTE: &str = "payloadFormat";
/// Payload format of notifications carrying an object resource
pub const JSON_API_V1: &str = "JSON_API_V1";

/// The subset of a Cloud Storage object resource the monitor reads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub generation: Option<String>,
    /// Object size in bytes
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
}

/// The JSON API encodes 64-bit integers as strings; plain numbers are accepted
/// too and null reads as 0
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Text(String),
        Number(u64),
    }

    match Option::<Size>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Size::Number(n)) => Ok(n),
        Some(Size::Text(s)) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl ObjectDescriptor {
    /// Decode an object resource from a notification payload
    pub fn from_payload(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// What the payload says about the object size
#[derive(Debug)]
pub enum ObjectSize {
    /// The payload format carries no object resource
    NotDescribed,
    /// The object resource reports a size of zero
    Empty,
    /// The object resource reports a non-zero size
    Bytes(u64),
    /// The payload claimed to be an object resource but did not decode
    Malformed(serde_json::Error),
}

/// Result of classifying one notification
#[derive(Debug)]
pub struct Classification<'a> {
    /// Event type attribute, empty when missing
    pub event_type: &'a str,
    /// Bucket attribute, empty when missing
    pub bucket: &'a str,
    pub object: ObjectSize,
    /// Decoded object resource, when the payload carried one
    pub descriptor: Option<ObjectDescriptor>,
}

/// Classify a notification from its attributes and payload
pub fn classify(message: &NotificationMessage) -> Classification<'_> {
    let (object, descriptor) = if message.attribute(PAYLOAD_FORMAT_ATTRIBUTE) == JSON_API_V1 {
        match ObjectDescriptor::from_payload(&message.data) {
            Ok(descriptor) if descriptor.size > 0 => {
                (ObjectSize::Bytes(descriptor.size), Some(descriptor))
            }
            Ok(descriptor) => (ObjectSize::Empty, Some(descriptor)),
            Err(e) => (ObjectSize::Malformed(e), None),
        }
    } else {
        (ObjectSize::NotDescribed, None)
    };

    Classification {
        event_type: message.attribute(EVENT_TYPE_ATTRIBUTE),
        bucket: message.attribute(BUCKET_ID_ATTRIBUTE),
        object,
        descriptor,
    }
}
