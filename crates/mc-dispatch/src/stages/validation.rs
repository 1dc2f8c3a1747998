//! Validation stage
//!
//! Verifies the envelope against the registry: the type tag must be
//! non-empty, the declared kind must agree with how the tag was
//! registered, and any per-type rules run last. Failures surface as
//! `ValidationFailed` without invoking the handler.

use async_trait::async_trait;
use mc_common::{Envelope, MercuryError, ProcessingContext, ProcessingResult};
use std::sync::Arc;

use crate::pipeline::{Next, PipelineStage};
use crate::registry::HandlerRegistry;

pub struct ValidationStage {
    registry: Arc<HandlerRegistry>,
}

impl ValidationStage {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), MercuryError> {
        if envelope.message_type.trim().is_empty() {
            return Err(MercuryError::ValidationFailed(
                "message type tag is empty".to_string(),
            ));
        }

        if envelope.message_id.is_nil() {
            return Err(MercuryError::ValidationFailed(
                "message id is nil".to_string(),
            ));
        }

        if let Some(registered) = self.registry.registered_kind(&envelope.message_type) {
            if registered != envelope.kind {
                return Err(MercuryError::ValidationFailed(format!(
                    "'{}' is registered as {} but the envelope declares {}",
                    envelope.message_type, registered, envelope.kind
                )));
            }
        }

        if let Some(validator) = self.registry.validator(&envelope.message_type) {
            validator.validate(envelope)?;
        }

        Ok(())
    }
}

#[async_trait]
impl PipelineStage for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        if let Err(error) = self.validate(envelope) {
            return ProcessingResult::failure(error);
        }
        next.run(envelope, ctx).await
    }
}
