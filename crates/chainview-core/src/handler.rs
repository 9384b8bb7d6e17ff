//! View handlers, handler sets, and handler loading.
//!
//! A view's transform logic is compiled code. It is deployed under a handler
//! location string; a [`HandlerLoader`] resolves that location to a
//! [`HandlerSet`] when the view is processed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::{ExecutionContext, TxMeta};
use crate::error::ViewError;
use crate::types::{ChainEvent, EventData};

/// Key of the catch-all handler.
pub const FALLBACK_KEY: &str = "*";

// ─── Payload ─────────────────────────────────────────────────────────────────

/// The event part of a handler payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub id: String,
    pub event_index: u32,
    pub event_type: String,
    pub data: EventData,
}

impl From<&ChainEvent> for EventMeta {
    fn from(event: &ChainEvent) -> Self {
        Self {
            id: event.id.clone(),
            event_index: event.event_index,
            event_type: event.event_type.clone(),
            data: event.data.clone(),
        }
    }
}

/// What a handler is invoked with: one matched event, or a matched
/// transaction that carried no qualifying events.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerPayload {
    pub tx: TxMeta,
    pub block_height: u64,
    pub event: Option<EventMeta>,
}

impl HandlerPayload {
    pub fn event_id(&self) -> Option<&str> {
        self.event.as_ref().map(|e| e.id.as_str())
    }

    /// A named field of the event's decoded data.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.event.as_ref().and_then(|e| e.data.field(name))
    }

    /// Flat JSON view: transaction fields, then event fields, then the
    /// event's composite data fields (or `data` for any other shape).
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        out.insert("tx_id".into(), Value::String(self.tx.tx_id.clone()));
        out.insert("type".into(), Value::String(self.tx.tx_type.clone()));
        out.insert("sender".into(), Value::String(self.tx.sender.clone()));
        out.insert("status".into(), Value::String(self.tx.status.clone()));
        out.insert("contract_id".into(), opt(&self.tx.contract_id));
        out.insert("function_name".into(), opt(&self.tx.function_name));
        out.insert("block_height".into(), Value::from(self.block_height));
        if let Some(event) = &self.event {
            out.insert("event_id".into(), Value::String(event.id.clone()));
            out.insert("event_index".into(), Value::from(event.event_index));
            out.insert("event_type".into(), Value::String(event.event_type.clone()));
            match &event.data {
                EventData::Composite(fields) => {
                    for (k, v) in fields {
                        out.insert(k.clone(), v.clone());
                    }
                }
                other => {
                    out.insert("data".into(), Value::from(other.clone()));
                }
            }
        }
        Value::Object(out)
    }
}

fn opt(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Transform logic for one source key.
///
/// Handlers write through the context only; the block processor owns the
/// store transaction.
#[async_trait]
pub trait ViewHandler: Send + Sync {
    async fn handle(&self, payload: &HandlerPayload, ctx: &mut ExecutionContext) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ViewHandler for FnHandler<F>
where
    F: Fn(&HandlerPayload, &mut ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, payload: &HandlerPayload, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        (self.0)(payload, ctx)
    }
}

/// Adapt a synchronous closure into a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn ViewHandler>
where
    F: Fn(&HandlerPayload, &mut ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers of one view, keyed by source key, with an optional `*` fallback.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: BTreeMap<String, Arc<dyn ViewHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn on(mut self, key: impl Into<String>, handler: Arc<dyn ViewHandler>) -> Self {
        self.insert(key, handler);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, handler: Arc<dyn ViewHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// The handler for `source_key`, else the `*` handler.
    pub fn resolve(&self, source_key: &str) -> Option<&Arc<dyn ViewHandler>> {
        self.handlers
            .get(source_key)
            .or_else(|| self.handlers.get(FALLBACK_KEY))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("keys", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolves a handler location to a handler set.
#[async_trait]
pub trait HandlerLoader: Send + Sync {
    async fn load(&self, handler_path: &str) -> Result<Arc<HandlerSet>, ViewError>;
}

/// Loader over handler sets registered in-process under their locations.
#[derive(Default)]
pub struct StaticHandlerLoader {
    sets: RwLock<HashMap<String, Arc<HandlerSet>>>,
}

impl StaticHandlerLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the set served for `handler_path`.
    pub fn register(&self, handler_path: impl Into<String>, set: HandlerSet) {
        self.sets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handler_path.into(), Arc::new(set));
    }

    pub fn with(self, handler_path: impl Into<String>, set: HandlerSet) -> Self {
        self.register(handler_path, set);
        self
    }
}

#[async_trait]
impl HandlerLoader for StaticHandlerLoader {
    async fn load(&self, handler_path: &str) -> Result<Arc<HandlerSet>, ViewError> {
        self.sets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handler_path)
            .cloned()
            .ok_or_else(|| ViewError::HandlerLoad {
                path: handler_path.to_string(),
                reason: "no handler set registered at this location".into(),
            })
    }
}
