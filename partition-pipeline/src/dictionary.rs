//! Lookup table from [`MessageType`] to the parser and handler for that type.
//!
//! Registration happens once at startup through [`TypeDictionaryBuilder`]. The built
//! dictionary is immutable and shared behind an `Arc`, so lookups from partition workers
//! need no locking.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::envelope::{Message, MessageType, Payload};
use crate::kafka::types::TopicPartition;

/// A decoded payload whose concrete type is known only to its parser and handler
pub type ParsedPayload = Box<dyn Any + Send>;

/// Everything a handler knows about the delivery it is processing
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub envelope: Arc<Message>,
    pub partition: TopicPartition,
    pub offset: i64,
    /// 1 for the first delivery, incremented on every redelivery of the same record
    pub attempt: u32,
}

#[async_trait]
pub trait MessageHandler<P: Payload>: Send + Sync + 'static {
    async fn handle(&self, payload: P, context: &HandlerContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F> {
    FnHandler { f }
}

#[async_trait]
impl<P, F, Fut> MessageHandler<P> for FnHandler<F>
where
    P: Payload,
    F: Fn(P, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: P, context: &HandlerContext) -> anyhow::Result<()> {
        (self.f)(payload, context.clone()).await
    }
}

pub trait Parser: Send + Sync {
    fn parse(&self, payload: &serde_json::Value) -> Result<ParsedPayload, serde_json::Error>;
}

struct JsonParser<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P: Payload> Parser for JsonParser<P> {
    fn parse(&self, payload: &serde_json::Value) -> Result<ParsedPayload, serde_json::Error> {
        let parsed: P = serde::Deserialize::deserialize(payload)?;
        let boxed: ParsedPayload = Box::new(parsed);
        Ok(boxed)
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: ParsedPayload, context: &HandlerContext)
        -> anyhow::Result<()>;
}

struct TypedHandler<P, H> {
    handler: H,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, H> Handler for TypedHandler<P, H>
where
    P: Payload,
    H: MessageHandler<P>,
{
    async fn handle(
        &self,
        payload: ParsedPayload,
        context: &HandlerContext,
    ) -> anyhow::Result<()> {
        let payload = payload.downcast::<P>().map_err(|_| {
            anyhow::anyhow!(
                "payload for {} is not a {}",
                context.envelope.message_type,
                std::any::type_name::<P>()
            )
        })?;
        self.handler.handle(*payload, context).await
    }
}

pub struct TypeDictionary {
    parsers: HashMap<MessageType, Arc<dyn Parser>>,
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
}

impl TypeDictionary {
    pub fn builder() -> TypeDictionaryBuilder {
        TypeDictionaryBuilder::default()
    }

    pub fn parser_for(&self, message_type: &MessageType) -> Option<&Arc<dyn Parser>> {
        self.parsers.get(message_type)
    }

    pub fn handler_for(&self, message_type: &MessageType) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(message_type)
    }

    pub fn handled_types(&self) -> Vec<&MessageType> {
        let mut types: Vec<&MessageType> = self.handlers.keys().collect();
        types.sort();
        types
    }
}

#[derive(Default)]
pub struct TypeDictionaryBuilder {
    parsers: HashMap<MessageType, Arc<dyn Parser>>,
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
}

impl TypeDictionaryBuilder {
    /// Register `handler` together with a JSON parser for `P`.
    ///
    /// A second handler for the same message type is a configuration error: it is
    /// logged and ignored, the first registration stays in place.
    pub fn register<P, H>(mut self, handler: H) -> Self
    where
        P: Payload,
        H: MessageHandler<P>,
    {
        let message_type = P::message_type();

        if self.handlers.contains_key(&message_type) {
            warn!(
                message_type = %message_type,
                handler = std::any::type_name::<H>(),
                "Duplicate handler registration, keeping the first one"
            );
            return self;
        }

        self = self.register_parser::<P>();
        self.handlers.insert(
            message_type,
            Arc::new(TypedHandler {
                handler,
                _payload: PhantomData::<fn() -> P>,
            }),
        );
        self
    }

    /// Register a parser without a handler
    pub fn register_parser<P: Payload>(mut self) -> Self {
        let message_type = P::message_type();

        if self.parsers.contains_key(&message_type) {
            return self;
        }

        self.parsers.insert(
            message_type,
            Arc::new(JsonParser {
                _payload: PhantomData::<fn() -> P>,
            }),
        );
        self
    }

    pub fn build(self) -> TypeDictionary {
        TypeDictionary {
            parsers: self.parsers,
            handlers: self.handlers,
        }
    }
}
