//! Command pipeline middlewares: Audit, Correlation, Transaction, Publish,
//! Dispatch, run outside-in in that fixed order around every command
//! (spec.md §3, §4.12, C12).

mod model;
mod pipeline;

pub use model::{Command, CommandHandler, NoopTransaction, NoopTransactionManager, Transaction, TransactionManager};
pub use pipeline::CommandPipeline;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ddd_audit::InMemoryCommandAuditRepository;
    use ddd_correlation::CorrelationContext;
    use ddd_events::{DomainEvent, DomainEventDispatcher, EventRouter, IntegrationEvent, IntegrationEventBus, IntegrationEventRecord, UnitOfWork};
    use ddd_schemas::{CommandSource, TenantId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug)]
    struct OrderPlaced {
        order_id: u64,
    }
    impl DomainEvent for OrderPlaced {
        fn name(&self) -> &'static str {
            "OrderPlaced"
        }
        fn to_json(&self) -> serde_json::Value {
            serde_json::json!({"order_id": self.order_id})
        }
    }
    impl IntegrationEvent for OrderPlaced {
        fn integration_action(&self) -> &'static str {
            "order.placed"
        }
    }

    struct PlaceOrder {
        quantity: u32,
        transactional: bool,
    }
    impl Command for PlaceOrder {
        fn name(&self) -> &'static str {
            "PlaceOrder"
        }
        fn source(&self) -> CommandSource {
            CommandSource::User
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"quantity": self.quantity})
        }
        fn blog_id(&self) -> TenantId {
            TenantId(1)
        }
        fn is_transactional(&self) -> bool {
            self.transactional
        }
    }

    struct PlaceOrderHandler;
    #[async_trait]
    impl CommandHandler<PlaceOrder> for PlaceOrderHandler {
        type Output = u64;
        async fn handle(&self, command: &PlaceOrder, uow: &mut UnitOfWork) -> anyhow::Result<u64> {
            let order_id = 42;
            uow.record(Box::new(OrderPlaced { order_id }));
            Ok(order_id * command.quantity as u64)
        }
    }

    struct FailingHandler;
    #[async_trait]
    impl CommandHandler<PlaceOrder> for FailingHandler {
        type Output = u64;
        async fn handle(&self, _command: &PlaceOrder, uow: &mut UnitOfWork) -> anyhow::Result<u64> {
            uow.record(Box::new(OrderPlaced { order_id: 1 }));
            anyhow::bail!("inventory unavailable")
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        names: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl DomainEventDispatcher for RecordingDispatcher {
        async fn dispatch(&self, event: &dyn DomainEvent) -> anyhow::Result<()> {
            self.names.lock().unwrap().push(event.name().to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<IntegrationEventRecord>>,
    }
    #[async_trait]
    impl IntegrationEventBus for RecordingBus {
        async fn publish(&self, record: IntegrationEventRecord, _ctx: &CorrelationContext) -> anyhow::Result<Uuid> {
            self.published.lock().unwrap().push(record);
            Ok(Uuid::new_v4())
        }
        async fn cancel_duplicates(&self, _event_type: &str, _sig: &str) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    struct RecordingTransaction {
        committed: AtomicBool,
        rolled_back: AtomicBool,
    }
    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn commit(&self) -> anyhow::Result<()> {
            self.committed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(&self) -> anyhow::Result<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTransactionManager {
        begun: Mutex<u32>,
    }
    #[async_trait]
    impl TransactionManager for RecordingTransactionManager {
        async fn begin(&self) -> anyhow::Result<Box<dyn Transaction>> {
            *self.begun.lock().unwrap() += 1;
            Ok(Box::new(RecordingTransaction {
                committed: AtomicBool::new(false),
                rolled_back: AtomicBool::new(false),
            }))
        }
    }

    fn pipeline(
        tx_manager: std::sync::Arc<dyn TransactionManager>,
        bus: std::sync::Arc<RecordingBus>,
    ) -> (CommandPipeline, std::sync::Arc<InMemoryCommandAuditRepository>, std::sync::Arc<RecordingDispatcher>) {
        let audit = std::sync::Arc::new(InMemoryCommandAuditRepository::new());
        let dispatcher = std::sync::Arc::new(RecordingDispatcher::default());
        let router = std::sync::Arc::new(EventRouter::new(dispatcher.clone(), bus));
        (CommandPipeline::new(audit.clone(), tx_manager, router), audit, dispatcher)
    }

    #[tokio::test]
    async fn successful_command_commits_and_writes_success_audit_row() {
        let bus = std::sync::Arc::new(RecordingBus::default());
        let tx_manager = std::sync::Arc::new(RecordingTransactionManager::default());
        let (pipe, _audit, dispatcher) = pipeline(tx_manager.clone(), bus.clone());

        let output = pipe
            .handle(PlaceOrder { quantity: 2, transactional: true }, &PlaceOrderHandler)
            .await
            .unwrap();

        assert_eq!(output, 84);
        assert_eq!(*dispatcher.names.lock().unwrap(), vec!["OrderPlaced"]);
        assert_eq!(bus.published.lock().unwrap().len(), 1);
        assert_eq!(*tx_manager.begun.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_handler_rolls_back_and_audit_row_records_the_error() {
        let bus = std::sync::Arc::new(RecordingBus::default());
        let tx_manager = std::sync::Arc::new(RecordingTransactionManager::default());
        let (pipe, _audit, dispatcher) = pipeline(tx_manager, bus.clone());

        let err = pipe
            .handle(PlaceOrder { quantity: 1, transactional: true }, &FailingHandler)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("inventory unavailable"));
        // Publish never ran (handler threw before draining), and nothing
        // commits on a failed transactional command.
        assert!(dispatcher.names.lock().unwrap().is_empty());
        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_transactional_command_never_opens_a_transaction() {
        let bus = std::sync::Arc::new(RecordingBus::default());
        let tx_manager = std::sync::Arc::new(RecordingTransactionManager::default());
        let (pipe, _audit, _dispatcher) = pipeline(tx_manager.clone(), bus);

        pipe.handle(PlaceOrder { quantity: 1, transactional: false }, &PlaceOrderHandler)
            .await
            .unwrap();

        assert_eq!(*tx_manager.begun.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn correlation_context_does_not_leak_between_commands() {
        let bus = std::sync::Arc::new(RecordingBus::default());
        let tx_manager = std::sync::Arc::new(RecordingTransactionManager::default());
        let (pipe, _audit, _dispatcher) = pipeline(tx_manager, bus);

        pipe.handle(PlaceOrder { quantity: 1, transactional: true }, &PlaceOrderHandler)
            .await
            .unwrap();

        assert!(ddd_correlation::try_with_current(|c| c.get()).is_none());
    }
}
