//! Signing stage
//!
//! HMAC-SHA256 over `timestamp + serialized body`, carried in envelope
//! metadata. Outbound envelopes are signed by [`MessageSigner::sign`];
//! the stage verifies inbound signatures with a constant-time compare
//! before the handler runs.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mc_common::{Envelope, MercuryError, ProcessingContext, ProcessingResult};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::pipeline::{Next, PipelineStage};

/// Metadata key holding the hex signature.
pub const SIGNATURE_KEY: &str = "signature";
/// Metadata key holding the signing timestamp.
pub const SIGNATURE_TIMESTAMP_KEY: &str = "signatureTimestamp";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub secret: String,
    /// When true, unsigned inbound messages are rejected.
    pub require_signature: bool,
}

/// Signs and verifies envelope payloads.
#[derive(Clone)]
pub struct MessageSigner {
    config: SigningConfig,
}

impl MessageSigner {
    pub fn new(config: SigningConfig) -> Self {
        Self { config }
    }

    fn compute(&self, timestamp: &str, body: &str) -> Result<String, MercuryError> {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .map_err(|e| MercuryError::internal(format!("HMAC key error: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn body_string(envelope: &Envelope) -> Result<String, MercuryError> {
        serde_json::to_string(&envelope.body).map_err(MercuryError::serialization)
    }

    /// Attach a signature to an outbound envelope.
    pub fn sign(&self, mut envelope: Envelope) -> Result<Envelope, MercuryError> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let body = Self::body_string(&envelope)?;
        let signature = self.compute(&timestamp, &body)?;
        envelope
            .metadata
            .insert(SIGNATURE_KEY.to_string(), signature);
        envelope
            .metadata
            .insert(SIGNATURE_TIMESTAMP_KEY.to_string(), timestamp);
        Ok(envelope)
    }

    /// Verify an inbound envelope's signature metadata.
    pub fn verify(&self, envelope: &Envelope) -> Result<(), MercuryError> {
        let signature = envelope.metadata.get(SIGNATURE_KEY);
        let timestamp = envelope.metadata.get(SIGNATURE_TIMESTAMP_KEY);

        let (signature, timestamp) = match (signature, timestamp) {
            (Some(signature), Some(timestamp)) => (signature, timestamp),
            _ if self.config.require_signature => {
                return Err(MercuryError::SignatureInvalid(
                    "missing signature metadata".to_string(),
                ))
            }
            _ => return Ok(()),
        };

        let body = Self::body_string(envelope)?;
        let expected = self.compute(timestamp, &body)?;

        // Constant-time compare over the hex forms.
        if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
            Ok(())
        } else {
            Err(MercuryError::SignatureInvalid(format!(
                "signature mismatch for message {}",
                envelope.message_id
            )))
        }
    }
}

pub struct SigningStage {
    signer: MessageSigner,
}

impl SigningStage {
    pub fn new(signer: MessageSigner) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl PipelineStage for SigningStage {
    fn name(&self) -> &'static str {
        "signing"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        if let Err(error) = self.signer.verify(envelope) {
            warn!(
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                "Signature verification failed"
            );
            return ProcessingResult::failure(error);
        }
        next.run(envelope, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Payment {
        amount: f64,
    }

    impl mc_common::CommandMessage for Payment {
        type Response = ();

        fn message_type() -> &'static str {
            "test.payment"
        }
    }

    fn signer(require: bool) -> MessageSigner {
        MessageSigner::new(SigningConfig {
            secret: "super-secret".to_string(),
            require_signature: require,
        })
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let signer = signer(true);
        let envelope = Envelope::command(&Payment { amount: 10.0 }).unwrap();

        let signed = signer.sign(envelope).unwrap();
        assert!(signed.metadata.contains_key(SIGNATURE_KEY));
        signer.verify(&signed).unwrap();
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signer = signer(true);
        let envelope = Envelope::command(&Payment { amount: 10.0 }).unwrap();

        let mut signed = signer.sign(envelope).unwrap();
        signed.body = serde_json::json!({"amount": 9999.0});

        assert!(matches!(
            signer.verify(&signed),
            Err(MercuryError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn missing_signature_rejected_only_when_required() {
        let envelope = Envelope::command(&Payment { amount: 1.0 }).unwrap();

        assert!(signer(false).verify(&envelope).is_ok());
        assert!(matches!(
            signer(true).verify(&envelope),
            Err(MercuryError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let envelope = Envelope::command(&Payment { amount: 10.0 }).unwrap();
        let signed = signer(true).sign(envelope).unwrap();

        let other = MessageSigner::new(SigningConfig {
            secret: "different".to_string(),
            require_signature: true,
        });
        assert!(other.verify(&signed).is_err());
    }
}
