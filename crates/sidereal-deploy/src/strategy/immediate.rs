//! Immediate updates: everything at once, nothing waited on.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{update_and_wait, Strategy, StrategyContext, UpdateEntry};
use crate::error::{DeployError, DeployResult};

/// Updates every machine without health waits.
///
/// A machine that fails to update is logged and skipped. Only unrecoverable
/// errors stop the run.
#[derive(Debug, Clone)]
pub struct ImmediateStrategy {
    ctx: StrategyContext,
}

impl ImmediateStrategy {
    #[must_use]
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Strategy for ImmediateStrategy {
    fn name(&self) -> &'static str {
        "immediate"
    }

    async fn apply(&self, entries: Vec<UpdateEntry>, cancel: &CancellationToken) -> DeployResult<()> {
        let total = entries.len();
        let limit = self.ctx.settings.max_concurrent;
        let ctx = &self.ctx;

        stream::iter(entries.into_iter().enumerate())
            .map(Ok::<_, DeployError>)
            .try_for_each_concurrent((limit > 0).then_some(limit), |(line, entry)| async move {
                if cancel.is_cancelled() {
                    return Err(DeployError::Cancelled);
                }
                let (_, result) = update_and_wait(ctx, &entry, line, false, cancel).await;
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_unrecoverable() => Err(e),
                    Err(e) => {
                        warn!(
                            machine_id = %entry.machine.id(),
                            error = %e,
                            "failed to update machine, continuing"
                        );
                        Ok(())
                    }
                }
            })
            .await?;

        info!(machines = total, "immediate update complete");
        Ok(())
    }
}
