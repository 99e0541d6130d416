//! Per-operation correlation context (spec.md §4.1, C1).
//!
//! The source this system was distilled from keeps correlation state in a
//! request-scoped global. On a parallel runtime that is wrong: a context must
//! travel with exactly one logical operation (one command, one resumed job),
//! never leak across tasks, and be cheaply re-constructible from the envelope
//! keys a durable job carries (`__correlation_id`, `__sequence`, `__event_id`).
//!
//! [`CorrelationContext`] is therefore a plain, owned value with interior
//! mutability for its three fields. Callers either thread it explicitly
//! through their call graph, or use [`scope`] to bind it to a `tokio` task via
//! `tokio::task_local!` for the duration of one future.

use std::cell::Cell;
use std::future::Future;
use uuid::Uuid;

pub const ENVELOPE_CORRELATION_ID: &str = "__correlation_id";
pub const ENVELOPE_SEQUENCE: &str = "__sequence";
pub const ENVELOPE_EVENT_ID: &str = "__event_id";

/// Correlation state for one logical operation.
///
/// Not `Sync` by design — a context belongs to one task at a time. Cloning is
/// not provided: hand out the context itself (or a fresh one seeded from
/// [`CorrelationContext::from_envelope`]) rather than duplicating sequence
/// counters, which would break the strictly-increasing-sequence invariant
/// (spec.md U4).
#[derive(Debug, Default)]
pub struct CorrelationContext {
    correlation_id: Cell<Option<Uuid>>,
    command_id: Cell<Option<Uuid>>,
    sequence: Cell<u64>,
}

impl CorrelationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a context with a known correlation id (e.g. resuming a process).
    pub fn with_id(id: Uuid) -> Self {
        let ctx = Self::new();
        ctx.set(id);
        ctx
    }

    /// Returns the correlation id, generating and caching a UUIDv4 if absent.
    pub fn get(&self) -> Uuid {
        if let Some(id) = self.correlation_id.get() {
            return id;
        }
        let id = Uuid::new_v4();
        self.correlation_id.set(Some(id));
        id
    }

    /// Returns the correlation id without generating one.
    pub fn peek(&self) -> Option<Uuid> {
        self.correlation_id.get()
    }

    pub fn set(&self, id: Uuid) {
        self.correlation_id.set(Some(id));
    }

    pub fn set_command_id(&self, id: Uuid) {
        self.command_id.set(Some(id));
    }

    pub fn command_id(&self) -> Option<Uuid> {
        self.command_id.get()
    }

    /// Next value in the monotonic per-correlation sequence, starting at 0.
    pub fn next_sequence(&self) -> u64 {
        let next = self.sequence.get();
        self.sequence.set(next + 1);
        next
    }

    /// Current sequence counter without advancing it.
    pub fn peek_sequence(&self) -> u64 {
        self.sequence.get()
    }

    /// Clear all fields. Callers (the correlation middleware, §4.12) must call
    /// this in a finally-block so state never leaks between operations that
    /// happen to reuse the same context value.
    pub fn reset(&self) {
        self.correlation_id.set(None);
        self.command_id.set(None);
        self.sequence.set(0);
    }

    /// Re-initialize from a durable job's wrapped payload envelope (spec.md §6).
    /// Returns `None` if the envelope lacks `__correlation_id`.
    pub fn from_envelope(payload: &serde_json::Value) -> Option<Self> {
        let correlation_id = payload
            .get(ENVELOPE_CORRELATION_ID)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())?;
        let sequence = payload
            .get(ENVELOPE_SEQUENCE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let ctx = Self::with_id(correlation_id);
        ctx.sequence.set(sequence);
        Some(ctx)
    }

    /// Inject `__correlation_id` / `__sequence` / `__event_id` into a payload,
    /// producing the wrapped envelope the outbox processor publishes (§4.5 step 3).
    pub fn wrap_envelope(
        &self,
        mut payload: serde_json::Value,
        sequence: u64,
        event_id: Uuid,
    ) -> serde_json::Value {
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert(
                ENVELOPE_CORRELATION_ID.to_string(),
                serde_json::Value::String(self.get().to_string()),
            );
            map.insert(ENVELOPE_SEQUENCE.to_string(), serde_json::json!(sequence));
            map.insert(
                ENVELOPE_EVENT_ID.to_string(),
                serde_json::Value::String(event_id.to_string()),
            );
        }
        payload
    }
}

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// Bind `ctx` as the ambient correlation context for the duration of `fut`.
///
/// Use this at the boundary where a logical operation begins (pipeline entry,
/// job dispatch). Code deeper in the call graph that cannot easily thread a
/// `&CorrelationContext` parameter can reach it via [`with_current`].
pub async fn scope<F: Future>(ctx: CorrelationContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// Access the ambient context bound by the innermost enclosing [`scope`].
///
/// Panics if called outside of a `scope` — this is a programming error
/// (§7 "Incorrect usage"), not a runtime condition to recover from.
pub fn with_current<R>(f: impl FnOnce(&CorrelationContext) -> R) -> R {
    CURRENT.with(f)
}

/// Like [`with_current`] but returns `None` instead of panicking when no
/// scope is active.
pub fn try_with_current<R>(f: impl FnOnce(&CorrelationContext) -> R) -> Option<R> {
    CURRENT.try_with(f).ok()
}
