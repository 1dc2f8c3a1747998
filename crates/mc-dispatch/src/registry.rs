//! Handler registry
//!
//! Built once at startup: a map from message-type tag to handler entry.
//! Commands and queries allow exactly one handler per tag; events keep a
//! list and fan out. Typed handlers are erased behind [`ErasedHandler`]
//! so the dispatch path works purely on envelopes.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use mc_common::{
    CommandMessage, Envelope, EventMessage, MercuryError, MessageKind, ProcessingContext,
    ProcessingResult, QueryMessage, Result,
};

// ============================================================================
// Typed handler traits
// ============================================================================

#[async_trait]
pub trait CommandHandler<C: CommandMessage>: Send + Sync + 'static {
    async fn handle(&self, command: C, ctx: &ProcessingContext) -> Result<C::Response>;
}

#[async_trait]
pub trait QueryHandler<Q: QueryMessage>: Send + Sync + 'static {
    async fn handle(&self, query: Q, ctx: &ProcessingContext) -> Result<Q::Response>;
}

#[async_trait]
pub trait EventHandler<E: EventMessage>: Send + Sync + 'static {
    async fn handle(&self, event: E, ctx: &ProcessingContext) -> Result<()>;
}

/// Per-type message rules consulted by the validation stage.
pub trait MessageValidator: Send + Sync {
    fn validate(&self, envelope: &Envelope) -> Result<()>;
}

struct FnValidator<F>(F);

impl<F> MessageValidator for FnValidator<F>
where
    F: Fn(&Envelope) -> Result<()> + Send + Sync,
{
    fn validate(&self, envelope: &Envelope) -> Result<()> {
        (self.0)(envelope)
    }
}

// ============================================================================
// Erasure
// ============================================================================

/// A type-erased handler invocable with a raw envelope.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn invoke(&self, envelope: &Envelope, ctx: &ProcessingContext) -> ProcessingResult;
}

struct CommandAdapter<C, H> {
    handler: H,
    name: String,
    _marker: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, H> ErasedHandler for CommandAdapter<C, H>
where
    C: CommandMessage,
    H: CommandHandler<C>,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, envelope: &Envelope, ctx: &ProcessingContext) -> ProcessingResult {
        let command: C = match envelope.decode() {
            Ok(command) => command,
            Err(e) => {
                return ProcessingResult::failure(MercuryError::ValidationFailed(format!(
                    "malformed body for '{}': {}",
                    envelope.message_type, e
                )))
            }
        };
        match self.handler.handle(command, ctx).await {
            Ok(response) => match serde_json::to_value(response) {
                Ok(value) => ProcessingResult::success_with(value),
                Err(e) => ProcessingResult::failure(MercuryError::serialization(e)),
            },
            Err(error) => ProcessingResult::failure(error),
        }
    }
}

struct QueryAdapter<Q, H> {
    handler: H,
    name: String,
    _marker: PhantomData<fn() -> Q>,
}

#[async_trait]
impl<Q, H> ErasedHandler for QueryAdapter<Q, H>
where
    Q: QueryMessage,
    H: QueryHandler<Q>,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, envelope: &Envelope, ctx: &ProcessingContext) -> ProcessingResult {
        let query: Q = match envelope.decode() {
            Ok(query) => query,
            Err(e) => {
                return ProcessingResult::failure(MercuryError::ValidationFailed(format!(
                    "malformed body for '{}': {}",
                    envelope.message_type, e
                )))
            }
        };
        match self.handler.handle(query, ctx).await {
            Ok(response) => match serde_json::to_value(response) {
                Ok(value) => ProcessingResult::success_with(value),
                Err(e) => ProcessingResult::failure(MercuryError::serialization(e)),
            },
            Err(error) => ProcessingResult::failure(error),
        }
    }
}

struct EventAdapter<E, H> {
    handler: H,
    name: String,
    _marker: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for EventAdapter<E, H>
where
    E: EventMessage,
    H: EventHandler<E>,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, envelope: &Envelope, ctx: &ProcessingContext) -> ProcessingResult {
        let event: E = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                return ProcessingResult::failure(MercuryError::ValidationFailed(format!(
                    "malformed body for '{}': {}",
                    envelope.message_type, e
                )))
            }
        };
        match self.handler.handle(event, ctx).await {
            Ok(()) => ProcessingResult::success(),
            Err(error) => ProcessingResult::failure(error),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct HandlerEntry {
    pub message_type: String,
    pub kind: MessageKind,
    pub handler: Arc<dyn ErasedHandler>,
}

/// Startup-built lookup from message-type tag to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<String, HandlerEntry>,
    queries: HashMap<String, HandlerEntry>,
    events: HashMap<String, Vec<HandlerEntry>>,
    validators: HashMap<String, Arc<dyn MessageValidator>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the unique handler for a command type.
    pub fn register_command<C, H>(&mut self, handler: H) -> Result<()>
    where
        C: CommandMessage,
        H: CommandHandler<C>,
    {
        let tag = C::message_type();
        if self.commands.contains_key(tag) {
            return Err(MercuryError::internal(format!(
                "command handler already registered for '{}'",
                tag
            )));
        }
        self.commands.insert(
            tag.to_string(),
            HandlerEntry {
                message_type: tag.to_string(),
                kind: MessageKind::Command,
                handler: Arc::new(CommandAdapter {
                    handler,
                    name: std::any::type_name::<H>().to_string(),
                    _marker: PhantomData::<fn() -> C>,
                }),
            },
        );
        Ok(())
    }

    /// Register the unique handler for a query type.
    pub fn register_query<Q, H>(&mut self, handler: H) -> Result<()>
    where
        Q: QueryMessage,
        H: QueryHandler<Q>,
    {
        let tag = Q::message_type();
        if self.queries.contains_key(tag) {
            return Err(MercuryError::internal(format!(
                "query handler already registered for '{}'",
                tag
            )));
        }
        self.queries.insert(
            tag.to_string(),
            HandlerEntry {
                message_type: tag.to_string(),
                kind: MessageKind::Query,
                handler: Arc::new(QueryAdapter {
                    handler,
                    name: std::any::type_name::<H>().to_string(),
                    _marker: PhantomData::<fn() -> Q>,
                }),
            },
        );
        Ok(())
    }

    /// Add an event handler; any number may subscribe to one tag.
    pub fn register_event<E, H>(&mut self, handler: H)
    where
        E: EventMessage,
        H: EventHandler<E>,
    {
        let tag = E::message_type();
        self.events
            .entry(tag.to_string())
            .or_default()
            .push(HandlerEntry {
                message_type: tag.to_string(),
                kind: MessageKind::Event,
                handler: Arc::new(EventAdapter {
                    handler,
                    name: std::any::type_name::<H>().to_string(),
                    _marker: PhantomData::<fn() -> E>,
                }),
            });
    }

    pub fn register_validator(
        &mut self,
        message_type: &str,
        validator: Arc<dyn MessageValidator>,
    ) {
        self.validators.insert(message_type.to_string(), validator);
    }

    pub fn register_validator_fn<F>(&mut self, message_type: &str, validate: F)
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.register_validator(message_type, Arc::new(FnValidator(validate)));
    }

    pub fn command(&self, message_type: &str) -> Option<&HandlerEntry> {
        self.commands.get(message_type)
    }

    pub fn query(&self, message_type: &str) -> Option<&HandlerEntry> {
        self.queries.get(message_type)
    }

    pub fn events(&self, message_type: &str) -> &[HandlerEntry] {
        self.events
            .get(message_type)
            .map(|entries| entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn validator(&self, message_type: &str) -> Option<&Arc<dyn MessageValidator>> {
        self.validators.get(message_type)
    }

    /// The kind this tag is registered under, if any.
    pub fn registered_kind(&self, message_type: &str) -> Option<MessageKind> {
        if self.commands.contains_key(message_type) {
            Some(MessageKind::Command)
        } else if self.queries.contains_key(message_type) {
            Some(MessageKind::Query)
        } else if self.events.contains_key(message_type) {
            Some(MessageKind::Event)
        } else {
            None
        }
    }

    pub fn handler_count(&self) -> usize {
        self.commands.len()
            + self.queries.len()
            + self.events.values().map(Vec::len).sum::<usize>()
    }
}
