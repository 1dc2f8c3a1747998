//! Pipeline composition
//!
//! A linear chain of stages built at registration time; each stage holds
//! no reference to the dispatcher, only to the next stage via [`Next`].
//! Stages must be transparent to downstream contracts: they propagate
//! cancellation and never mutate the inbound envelope.

use std::sync::Arc;

use async_trait::async_trait;
use mc_common::{Envelope, ProcessingConfig, ProcessingContext, ProcessingResult};
use mc_storage::IdempotencyStore;

use crate::registry::{ErasedHandler, HandlerRegistry};
use crate::stages::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitBreakerStage};
use crate::stages::idempotency::{IdempotencyPolicy, IdempotencyStage};
use crate::stages::logging::LoggingStage;
use crate::stages::retry::{RetryPolicy, RetryStage};
use crate::stages::signing::{MessageSigner, SigningStage};
use crate::stages::validation::ValidationStage;

/// One cross-cutting concern wrapping handler invocation.
#[async_trait]
pub trait PipelineStage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult;
}

/// Continuation into the remainder of the chain.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[Arc<dyn PipelineStage>]>,
    index: usize,
    terminal: Arc<dyn ErasedHandler>,
}

impl Next {
    pub async fn run(&self, envelope: &Envelope, ctx: &ProcessingContext) -> ProcessingResult {
        match self.stages.get(self.index) {
            Some(stage) => {
                let next = Next {
                    stages: Arc::clone(&self.stages),
                    index: self.index + 1,
                    terminal: Arc::clone(&self.terminal),
                };
                stage.execute(envelope, ctx, next).await
            }
            None => self.terminal.invoke(envelope, ctx).await,
        }
    }
}

/// The composed stage chain.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn PipelineStage>]>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    /// Run the chain, ending in the handler itself.
    pub async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        terminal: Arc<dyn ErasedHandler>,
    ) -> ProcessingResult {
        let next = Next {
            stages: Arc::clone(&self.stages),
            index: 0,
            terminal,
        };
        next.run(envelope, ctx).await
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Assembles the documented stage order from configuration.
///
/// Outermost to innermost: logging, validation, signing (optional),
/// idempotency (optional), circuit breaker, retry.
pub struct PipelineBuilder {
    config: ProcessingConfig,
    registry: Option<Arc<HandlerRegistry>>,
    signer: Option<MessageSigner>,
    idempotency: Option<(Arc<dyn IdempotencyStore>, IdempotencyPolicy)>,
    breakers: Option<Arc<BreakerRegistry>>,
    retried_counter: Option<Arc<std::sync::atomic::AtomicU64>>,
}

impl PipelineBuilder {
    pub fn new(config: ProcessingConfig) -> Self {
        Self {
            config,
            registry: None,
            signer: None,
            idempotency: None,
            breakers: None,
            retried_counter: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_signer(mut self, signer: MessageSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_idempotency(
        mut self,
        store: Arc<dyn IdempotencyStore>,
        policy: IdempotencyPolicy,
    ) -> Self {
        self.idempotency = Some((store, policy));
        self
    }

    pub fn with_breaker_registry(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_retried_counter(
        mut self,
        counter: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        self.retried_counter = Some(counter);
        self
    }

    pub fn build(self) -> Pipeline {
        let mut stages: Vec<Arc<dyn PipelineStage>> = Vec::new();

        stages.push(Arc::new(LoggingStage::new()));

        if let Some(registry) = self.registry {
            stages.push(Arc::new(ValidationStage::new(registry)));
        }

        if let Some(signer) = self.signer {
            stages.push(Arc::new(SigningStage::new(signer)));
        }

        if let Some((store, policy)) = self.idempotency {
            stages.push(Arc::new(IdempotencyStage::new(store, policy)));
        }

        if self.config.enable_circuit_breaker {
            let breakers = self.breakers.unwrap_or_else(|| {
                Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
                    failure_threshold: self.config.circuit_breaker_threshold,
                    break_duration: self.config.circuit_breaker_timeout,
                }))
            });
            stages.push(Arc::new(CircuitBreakerStage::new(breakers)));
        }

        let retry_policy = RetryPolicy::from_processing_config(&self.config);
        let mut retry = RetryStage::new(retry_policy);
        if let Some(counter) = self.retried_counter {
            retry = retry.with_counter(counter);
        }
        stages.push(Arc::new(retry));

        Pipeline::new(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::MercuryError;

    struct RecordingStage {
        label: &'static str,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PipelineStage for RecordingStage {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn execute(
            &self,
            envelope: &Envelope,
            ctx: &ProcessingContext,
            next: Next,
        ) -> ProcessingResult {
            self.order.lock().push(self.label);
            next.run(envelope, ctx).await
        }
    }

    struct OkHandler;

    #[async_trait]
    impl ErasedHandler for OkHandler {
        fn handler_name(&self) -> &str {
            "ok"
        }

        async fn invoke(
            &self,
            _envelope: &Envelope,
            _ctx: &ProcessingContext,
        ) -> ProcessingResult {
            ProcessingResult::success()
        }
    }

    fn envelope() -> Envelope {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Noop;
        impl mc_common::EventMessage for Noop {
            fn message_type() -> &'static str {
                "test.noop"
            }
        }
        Envelope::event(&Noop).unwrap()
    }

    #[tokio::test]
    async fn stages_run_outermost_first() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(RecordingStage {
                label: "outer",
                order: Arc::clone(&order),
            }),
            Arc::new(RecordingStage {
                label: "inner",
                order: Arc::clone(&order),
            }),
        ]);

        let result = pipeline
            .execute(&envelope(), &ProcessingContext::new("test"), Arc::new(OkHandler))
            .await;
        assert!(result.is_success());
        assert_eq!(*order.lock(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn short_circuiting_stage_skips_handler() {
        struct RejectStage;

        #[async_trait]
        impl PipelineStage for RejectStage {
            fn name(&self) -> &'static str {
                "reject"
            }

            async fn execute(
                &self,
                _envelope: &Envelope,
                _ctx: &ProcessingContext,
                _next: Next,
            ) -> ProcessingResult {
                ProcessingResult::failure(MercuryError::ValidationFailed("nope".into()))
            }
        }

        let pipeline = Pipeline::new(vec![Arc::new(RejectStage)]);
        let result = pipeline
            .execute(&envelope(), &ProcessingContext::new("test"), Arc::new(OkHandler))
            .await;
        assert!(matches!(
            result.error(),
            Some(MercuryError::ValidationFailed(_))
        ));
    }

    #[test]
    fn builder_assembles_documented_order() {
        let mut registry = HandlerRegistry::new();
        let _ = &mut registry;
        let pipeline = PipelineBuilder::new(ProcessingConfig::default())
            .with_registry(Arc::new(registry))
            .build();
        assert_eq!(
            pipeline.stage_names(),
            vec!["logging", "validation", "circuit_breaker", "retry"]
        );
    }

}
