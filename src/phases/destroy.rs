/// Destroy phase: label-scoped sweep
use anyhow::Result;
use tracing::info;

use crate::pipeline::Context;

/// Everything the cluster owns carries the `cluster` label (plus
/// `test-id` when set); one selector sweep removes it all, the state
/// marker included. Deletion ordering lives in the infrastructure
/// manager.
pub async fn run(ctx: &mut Context) -> Result<()> {
    let selector = ctx.config.selector_labels();
    ctx.infra.cleanup_by_label(&selector).await?;
    info!("Cluster {} destroyed", ctx.config.cluster_name);
    Ok(())
}
