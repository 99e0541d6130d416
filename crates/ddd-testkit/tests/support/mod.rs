use async_trait::async_trait;
use ddd_events::{DomainEvent, IntegrationEvent, UnitOfWork};
use ddd_pipeline::{Command, CommandHandler};
use ddd_schemas::{CommandSource, TenantId};

#[derive(Debug)]
pub struct UserEarned {
    pub user_id: u64,
    pub amount: u64,
}
impl DomainEvent for UserEarned {
    fn name(&self) -> &'static str {
        "UserEarned"
    }
    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({"user_id": self.user_id, "amount": self.amount})
    }
}
impl IntegrationEvent for UserEarned {
    fn integration_action(&self) -> &'static str {
        "user.earned"
    }
}

pub struct AwardPoints {
    pub user_id: u64,
    pub amount: u64,
}
impl Command for AwardPoints {
    fn name(&self) -> &'static str {
        "AwardPoints"
    }
    fn source(&self) -> CommandSource {
        CommandSource::User
    }
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"user_id": self.user_id, "amount": self.amount})
    }
    fn blog_id(&self) -> TenantId {
        TenantId(1)
    }
}

pub struct AwardPointsHandler;
#[async_trait]
impl CommandHandler<AwardPoints> for AwardPointsHandler {
    type Output = ();
    async fn handle(&self, command: &AwardPoints, uow: &mut UnitOfWork) -> anyhow::Result<()> {
        uow.record(Box::new(UserEarned { user_id: command.user_id, amount: command.amount }));
        Ok(())
    }
}
