use edgechain_health::{HealthChain, ProbeResult};
use serde_json::json;

use super::Context;

/// Step the built chain through `ticks` probe intervals with every task
/// answering (or failing) its health check.
pub fn run(ctx: &Context, ticks: u32, failing: bool) -> anyhow::Result<()> {
    let (_, deployment) = ctx.orchestrator()?.build()?;
    let chain_ports = deployment.port_chain;
    let mut chain = HealthChain::new(
        deployment.internal,
        deployment.external,
        chain_ports.internal_port,
        chain_ports.external_port,
    );
    let answer = if failing { ProbeResult::Failed } else { ProbeResult::Healthy };

    let mut snapshots = Vec::new();
    let mut text = Vec::new();
    for _ in 0..ticks {
        let snapshot = chain.tick(|_| answer);
        text.push(format!(
            "tick {}: internal {:?}, external {:?}",
            snapshot.tick, snapshot.internal, snapshot.external
        ));
        snapshots.push(snapshot);
    }
    ctx.emit(&json!({ "snapshots": snapshots }), &text.join("\n"))
}
