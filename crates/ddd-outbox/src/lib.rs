//! Transactional outbox: store (C4), processor (C5), publisher/router (C6).

mod bus;
mod processor;
mod publisher;
mod store;

pub use bus::OutboxBus;
pub use processor::{OutboxProcessor, OutboxPublisher, ProcessingResult};
pub use publisher::{AsyncQueue, DefaultTransportResolver, ExternalSink, OutboxRouter, RouterConfig, TransportResolver};
pub use store::{BackoffPolicy, DlqEntry, InMemoryOutboxStore, NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStore};
