//! Shared, dependency-free data types used across the reliability core.
//!
//! This crate is the `mqk-schemas` analogue: plain value types with no
//! business logic, safe for every other crate in the workspace to depend on
//! without risking a cycle.

use serde::{Deserialize, Serialize};

/// Tenant scope carried by every persisted row (`blog_id` in spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub i64);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A polymorphic `{_class, _data}` envelope for persisted payloads/checkpoints.
///
/// Mirrors the adjacently-tagged `#[serde(tag = "_class", content = "_data")]`
/// shape spec.md §9 calls for in place of reflection-based class lookup: each
/// concrete payload type registers a short `class` tag and `serde` dispatches
/// on it. `Tagged` itself is the erased, storage-facing form used when the
/// concrete type is not known at the call site (e.g. a `LongProcess.payload`
/// column read back before the process type's step table is consulted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged {
    #[serde(rename = "_class")]
    pub class: String,
    #[serde(rename = "_data")]
    pub data: serde_json::Value,
}

impl Tagged {
    pub fn new(class: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            class: class.into(),
            data,
        }
    }

    /// Erase a concrete, adjacently-tagged payload type into a `Tagged` envelope.
    pub fn from_typed<T: Serialize>(class: impl Into<String>, value: &T) -> anyhow::Result<Self> {
        let data = serde_json::to_value(value)?;
        Ok(Self::new(class, data))
    }

    /// Reconstruct a concrete type from the envelope, asserting the class tag matches.
    pub fn into_typed<T: for<'de> Deserialize<'de>>(self, expected_class: &str) -> anyhow::Result<T> {
        if self.class != expected_class {
            anyhow::bail!(
                "tagged payload class mismatch: expected '{}', got '{}'",
                expected_class,
                self.class
            );
        }
        Ok(serde_json::from_value(self.data)?)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }

            pub fn parse(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($wire => Ok(Self::$variant),)+
                    other => anyhow::bail!(concat!(stringify!($name), ": invalid value '{}'"), other),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

string_enum!(MessageKind {
    Event => "event",
    Command => "command",
});

string_enum!(Transport {
    InProcess => "in_process",
    External => "external",
});

string_enum!(OutboxStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Dlq => "dlq",
    Cancelled => "cancelled",
});

impl OutboxStatus {
    /// Terminal states never transition again (spec.md data model invariants).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dlq | Self::Cancelled)
    }
}

string_enum!(ProcessStatus {
    Pending => "pending",
    Running => "running",
    Scheduled => "scheduled",
    Suspended => "suspended",
    Completed => "completed",
    Failed => "failed",
});

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

string_enum!(WorkItemStatus {
    Pending => "pending",
    Waiting => "waiting",
    Failed => "failed",
    Done => "done",
    Skipped => "skipped",
});

string_enum!(BehaviourExecutionStatus {
    Completed => "completed",
    Batched => "batched",
    Forked => "forked",
    Waiting => "waiting",
    Skipped => "skipped",
    Failed => "failed",
    Cancelled => "cancelled",
    Preempted => "preempted",
});

string_enum!(CommandAuditStatus {
    InProgress => "in_progress",
    Success => "success",
    Error => "error",
});

string_enum!(CommandSource {
    User => "user",
    Cli => "cli",
    System => "system",
});

/// Cooperative yield signal shared by the long-process and workflow runners
/// (spec.md §4.14 / §5): when exceeded, the current worker stops doing more
/// work in-process and enqueues a continuation job instead of blocking.
#[derive(Debug, Clone, Copy)]
pub struct ResourceBudget {
    pub started_at: std::time::Instant,
    pub max_execution_seconds: u64,
    pub memory_limit_percent: f64,
}

impl ResourceBudget {
    pub fn new(max_execution_seconds: u64, memory_limit_percent: f64) -> Self {
        Self {
            started_at: std::time::Instant::now(),
            max_execution_seconds,
            memory_limit_percent,
        }
    }

    /// True once wall-clock elapsed passes the configured ceiling, or the
    /// caller-supplied current memory fraction passes `memory_limit_percent`.
    /// Memory sampling is host-specific (the source reads a process RSS
    /// figure); callers pass the fraction they measured, defaulting to `0.0`
    /// when no sampler is wired up.
    pub fn exceeded(&self, current_memory_fraction: f64) -> bool {
        let elapsed = self.started_at.elapsed().as_secs();
        elapsed >= self.max_execution_seconds || current_memory_fraction >= self.memory_limit_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_string() {
        for s in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
            OutboxStatus::Dlq,
            OutboxStatus::Cancelled,
        ] {
            assert_eq!(OutboxStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn terminal_states_are_exactly_spec_set() {
        assert!(OutboxStatus::Completed.is_terminal());
        assert!(OutboxStatus::Dlq.is_terminal());
        assert!(OutboxStatus::Cancelled.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
        assert!(!OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn tagged_round_trips() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            order_id: u64,
        }
        let t = Tagged::from_typed("OrderPlaced", &Payload { order_id: 42 }).unwrap();
        let back: Payload = t.into_typed("OrderPlaced").unwrap();
        assert_eq!(back, Payload { order_id: 42 });
    }

    #[test]
    fn tagged_rejects_class_mismatch() {
        let t = Tagged::new("A", serde_json::json!({}));
        let err = t.into_typed::<serde_json::Value>("B").unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn resource_budget_not_exceeded_when_fresh() {
        let budget = ResourceBudget::new(25, 0.8);
        assert!(!budget.exceeded(0.0));
    }

    #[test]
    fn resource_budget_exceeded_by_memory_fraction() {
        let budget = ResourceBudget::new(25, 0.8);
        assert!(budget.exceeded(0.9));
    }
}
