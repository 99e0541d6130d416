//! Event model & router (spec.md §4.2, C2).
//!
//! Two kinds of events: a [`DomainEvent`] is a local signal dispatched to
//! in-process subscribers; an [`IntegrationEvent`] additionally carries a
//! stable wire name and a scalarized payload and is durably published via the
//! outbox (spec.md §4.4). Only integration events ever reach the outbox.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ddd_correlation::CorrelationContext;
use ddd_schemas::MessageKind;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A local signal that something happened in the domain model.
///
/// `name()` doubles as the dispatch key a [`DomainEventDispatcher`] uses to
/// find subscribers (spec.md §6: "delivers to in-process subscribers named by
/// `event.action()`"). `to_json()` is the event's own representation for
/// dispatcher-side logging/inspection; it is *not* the wire payload (that is
/// [`IntegrationEvent::to_record`]'s job, and only integration events have one).
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn to_json(&self) -> serde_json::Value;
}

/// An outbound integration event: durable, with a stable wire name
/// (`integration_action`) independent of the in-process dispatcher.
///
/// Scalarization of the payload is enforced by the type system rather than a
/// runtime recursive walk: implementors build `to_json()` (inherited from
/// [`DomainEvent`]) using `#[derive(Serialize)]`, where entities implement
/// `Serialize` to emit their id, enums serialize to their wire value, and
/// `chrono::DateTime<Utc>` serializes to ISO-8601 by construction. This is
/// the Rust-native equivalent of spec.md §4.2's scalarization rules — the
/// compiler, not a recursive interpreter, enforces that only scalars/known
/// conversions ever reach the wire.
pub trait IntegrationEvent: DomainEvent {
    fn integration_action(&self) -> &'static str;
    fn delay_seconds(&self) -> i64 {
        0
    }
    fn is_unique(&self) -> bool {
        false
    }
    fn queue(&self) -> Option<String> {
        None
    }
    fn message_kind(&self) -> MessageKind {
        MessageKind::Event
    }

    /// Erase this event into the plain record the outbox store persists.
    fn to_record(&self) -> IntegrationEventRecord {
        IntegrationEventRecord {
            event_type: self.name().to_string(),
            integration_action: self.integration_action().to_string(),
            payload: self.to_json(),
            delay_seconds: self.delay_seconds(),
            is_unique: self.is_unique(),
            queue: self.queue(),
            message_kind: self.message_kind(),
        }
    }
}

/// The erased form of an integration event, as written to the outbox.
#[derive(Debug, Clone)]
pub struct IntegrationEventRecord {
    pub event_type: String,
    pub integration_action: String,
    pub payload: serde_json::Value,
    pub delay_seconds: i64,
    pub is_unique: bool,
    pub queue: Option<String>,
    pub message_kind: MessageKind,
}

impl IntegrationEventRecord {
    /// A content signature for exact-match duplicate supersession.
    ///
    /// spec.md §9 notes the source accepts a payload signature parameter to
    /// `cancel_duplicates` but only matches by event type in the baseline —
    /// exact-signature matching is left as an open extension. We compute the
    /// signature here (sha256 of the canonical, key-sorted JSON) so a future
    /// `IntegrationEventBus` implementation can opt into exact matching
    /// without changing this crate's public surface.
    pub fn payload_signature(&self) -> String {
        let canonical = canonical_json(&self.payload);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Sort object keys recursively and emit compact JSON, for stable hashing.
fn canonical_json(v: &serde_json::Value) -> String {
    fn sort_keys(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                let mut new = serde_json::Map::new();
                for k in keys {
                    new.insert(k.clone(), sort_keys(&map[&k]));
                }
                serde_json::Value::Object(new)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(sort_keys).collect())
            }
            _ => v.clone(),
        }
    }
    serde_json::to_string(&sort_keys(v)).expect("json serialization must not fail")
}

/// Abstract local subscriber bus (spec.md §6). Host-specific — modeled on a
/// platform hook/observer bus; any pub/sub shape satisfies the contract.
#[async_trait]
pub trait DomainEventDispatcher: Send + Sync {
    async fn dispatch(&self, event: &dyn DomainEvent) -> Result<()>;
}

/// Abstract durable publish target (spec.md §6). The default production
/// implementation (the outbox) lives in `ddd-outbox`, kept separate so this
/// crate has no database dependency.
#[async_trait]
pub trait IntegrationEventBus: Send + Sync {
    /// Publish one integration event inside the current transaction/unit of
    /// work, returning the durably assigned `event_id`.
    async fn publish(
        &self,
        record: IntegrationEventRecord,
        ctx: &CorrelationContext,
    ) -> Result<Uuid>;

    /// Supersede prior pending+unique rows of the same event type.
    async fn cancel_duplicates(&self, event_type: &str, payload_signature: &str) -> Result<u64>;
}

/// Object-safe erasure bridging [`DomainEvent`] and [`IntegrationEvent`].
///
/// A buffer that must hold heterogeneous recorded events (the unit of work,
/// below) cannot hold `Box<dyn IntegrationEvent>` — `to_record` takes a
/// generic-free path only through a concrete type. Every event type
/// implements `AnyEvent`, either via the blanket impl below (if it is also an
/// [`IntegrationEvent`]) or with an empty `impl AnyEvent for MyDomainEvent {}`
/// for pure domain events.
pub trait AnyEvent: DomainEvent {
    fn integration_record(&self) -> Option<IntegrationEventRecord> {
        None
    }
}

impl<T: IntegrationEvent> AnyEvent for T {
    fn integration_record(&self) -> Option<IntegrationEventRecord> {
        Some(self.to_record())
    }
}

/// Per-command buffer collecting events recorded by aggregates (spec.md §4.3, C3).
///
/// The Publish middleware (C12) resets this before invoking a command handler,
/// then after the handler returns calls [`UnitOfWork::drain`] and routes each
/// event through an [`EventRouter`].
#[derive(Default)]
pub struct UnitOfWork {
    queued: Vec<Box<dyn AnyEvent>>,
    published: Vec<String>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.queued.clear();
        self.published.clear();
    }

    pub fn record(&mut self, event: Box<dyn AnyEvent>) {
        self.queued.push(event);
    }

    /// Drain events recorded directly on an aggregate root into the buffer.
    /// `events` is typically `aggregate.take_events()` on the caller's side.
    pub fn collect_from(&mut self, events: Vec<Box<dyn AnyEvent>>) {
        self.queued.extend(events);
    }

    /// Take the queued events, recording their names in the audit log.
    pub fn drain(&mut self) -> Vec<Box<dyn AnyEvent>> {
        let drained = std::mem::take(&mut self.queued);
        self.published.extend(drained.iter().map(|e| e.name().to_string()));
        drained
    }

    /// Names of every event drained so far this command (the audit view).
    pub fn published(&self) -> &[String] {
        &self.published
    }
}

/// Routes events to the local dispatcher and, for integration events, the bus.
///
/// Mirrors `mqk-execution::gateway::BrokerGateway`'s shape: a thin struct that
/// owns the collaborators it fans out to and enforces an invariant ordering
/// (local dispatch always happens; the bus additionally sees integration
/// events; unique events supersede their predecessors before being written).
pub struct EventRouter {
    dispatcher: Arc<dyn DomainEventDispatcher>,
    bus: Arc<dyn IntegrationEventBus>,
}

impl EventRouter {
    pub fn new(dispatcher: Arc<dyn DomainEventDispatcher>, bus: Arc<dyn IntegrationEventBus>) -> Self {
        Self { dispatcher, bus }
    }

    /// Publish a pure domain event: local dispatch only.
    pub async fn publish_domain(&self, event: &dyn DomainEvent) -> Result<()> {
        self.dispatcher.dispatch(event).await
    }

    /// Publish an integration event: local dispatch, then the durable bus.
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: &E,
        ctx: &CorrelationContext,
    ) -> Result<Uuid> {
        self.dispatcher.dispatch(event).await?;
        let record = event.to_record();
        if record.is_unique {
            let sig = record.payload_signature();
            self.bus.cancel_duplicates(&record.event_type, &sig).await?;
        }
        self.bus.publish(record, ctx).await
    }

    /// Publish an erased event (as drained from a [`UnitOfWork`]): always
    /// dispatches locally; additionally writes to the bus if the event
    /// carries an integration record. Returns the assigned `event_id` only
    /// for events that reached the bus.
    pub async fn publish_erased(
        &self,
        event: &dyn AnyEvent,
        ctx: &CorrelationContext,
    ) -> Result<Option<Uuid>> {
        self.dispatcher.dispatch(event).await?;
        let Some(record) = event.integration_record() else {
            return Ok(None);
        };
        if record.is_unique {
            let sig = record.payload_signature();
            self.bus.cancel_duplicates(&record.event_type, &sig).await?;
        }
        Ok(Some(self.bus.publish(record, ctx).await?))
    }
}
