//! In-process continuation schedulers: the saga/workflow engines ask to be
//! resumed later (spec.md §4.8.5, §4.11 step 3) without knowing how that
//! resumption is actually delivered. Here it's delivered by a channel this
//! crate's own consumer loop drains — the single-process analogue of the
//! teacher's job-queue-backed continuation delivery.

use async_trait::async_trait;
use ddd_process::ContinuationScheduler;
use ddd_workflow::WorkflowScheduler;
use tokio::sync::mpsc::UnboundedSender;

pub struct ChannelContinuationScheduler(pub(crate) UnboundedSender<i64>);

#[async_trait]
impl ContinuationScheduler for ChannelContinuationScheduler {
    async fn schedule_continuation(&self, process_id: i64) -> anyhow::Result<()> {
        self.0
            .send(process_id)
            .map_err(|_| anyhow::anyhow!("process continuation channel closed"))
    }
}

pub struct ChannelWorkflowScheduler(pub(crate) UnboundedSender<(i64, u64)>);

#[async_trait]
impl WorkflowScheduler for ChannelWorkflowScheduler {
    async fn reschedule(&self, workflow_id: i64, delay_seconds: u64) -> anyhow::Result<()> {
        self.0
            .send((workflow_id, delay_seconds))
            .map_err(|_| anyhow::anyhow!("workflow continuation channel closed"))
    }
}
