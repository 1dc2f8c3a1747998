//! Serializer contract
//!
//! Envelope codecs are pluggable; the core only consumes this trait. The
//! JSON implementation here is the default wire shape for the in-process
//! transport and the storage backends. Compression is declared by
//! configuration and must stay transparent to callers.

use bytes::Bytes;

use crate::{Envelope, MercuryError, Result};

/// Compression applied to serialized payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    #[default]
    None,
    Fastest,
    Optimal,
    SmallestSize,
}

#[derive(Debug, Clone)]
pub struct SerializerOptions {
    pub compression: CompressionLevel,
    /// Upper bound on a serialized payload; oversized messages are refused
    /// rather than truncated.
    pub max_payload_bytes: usize,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            compression: CompressionLevel::None,
            max_payload_bytes: 4 * 1024 * 1024,
        }
    }
}

/// A pluggable envelope codec.
pub trait MessageSerializer: Send + Sync {
    /// MIME content type advertised on the wire.
    fn content_type(&self) -> &str;

    fn serialize(&self, envelope: &Envelope) -> Result<Bytes>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Default JSON codec.
pub struct JsonSerializer {
    options: SerializerOptions,
}

impl JsonSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new(SerializerOptions::default())
    }
}

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Bytes> {
        let raw = serde_json::to_vec(envelope).map_err(MercuryError::serialization)?;
        if raw.len() > self.options.max_payload_bytes {
            return Err(MercuryError::Serialization(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                raw.len(),
                self.options.max_payload_bytes
            )));
        }
        Ok(Bytes::from(raw))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope> {
        if bytes.len() > self.options.max_payload_bytes {
            return Err(MercuryError::Serialization(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                bytes.len(),
                self.options.max_payload_bytes
            )));
        }
        serde_json::from_slice(bytes).map_err(MercuryError::serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageKind;

    fn sample_envelope() -> Envelope {
        Envelope {
            message_id: uuid::Uuid::new_v4(),
            message_type: "orders.created".to_string(),
            kind: MessageKind::Event,
            body: serde_json::json!({"orderId": "o1"}),
            correlation_id: None,
            causation_id: None,
            occurred_at: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer::default();
        let envelope = sample_envelope();

        let bytes = serializer.serialize(&envelope).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded.message_id, envelope.message_id);
        assert_eq!(decoded.message_type, envelope.message_type);
        assert_eq!(decoded.body, envelope.body);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let serializer = JsonSerializer::new(SerializerOptions {
            compression: CompressionLevel::None,
            max_payload_bytes: 16,
        });

        let result = serializer.serialize(&sample_envelope());
        assert!(matches!(result, Err(MercuryError::Serialization(_))));
    }
}
