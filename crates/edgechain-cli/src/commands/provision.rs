use edgechain_provision::{EnvironmentStatus, ProvisionError};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::Context;

pub fn plan(ctx: &Context) -> anyhow::Result<()> {
    let plan = ctx.orchestrator()?.plan()?;
    ctx.emit(&serde_json::to_value(&plan)?, &plan.to_string())
}

/// Apply until done or Ctrl-C; an interrupted run unwinds what it created.
pub async fn apply(ctx: &Context) -> anyhow::Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let report = match orchestrator.apply(cancel_rx).await {
        Ok(report) => report,
        Err(e) => {
            report_failure(&e);
            return Err(e.into());
        }
    };

    let outputs: serde_json::Map<String, serde_json::Value> = report
        .outputs
        .iter()
        .map(|o| (o.key.clone(), json!(o.value)))
        .collect();
    let warnings: Vec<String> = report.warnings.iter().map(ToString::to_string).collect();
    let mut text = format!("{}\n\nstatus: {:?}", report.plan, report.status);
    for w in &warnings {
        text.push_str(&format!("\nwarning: {w}"));
    }
    for o in &report.outputs {
        text.push_str(&format!("\n{} = {}", o.key, o.value));
    }
    if report.status == EnvironmentStatus::Degraded {
        warn!(env = %report.env, warnings = warnings.len(), "environment is degraded");
    }
    ctx.emit(
        &json!({
            "env": report.env,
            "run_id": report.run_id,
            "status": report.status,
            "plan": report.plan,
            "warnings": warnings,
            "outputs": outputs,
        }),
        &text,
    )
}

fn report_failure(e: &ProvisionError) {
    match e.reference() {
        Some(reference) => error!(step = ?e.step(), kind = %e.kind(), reference, "apply failed"),
        None => error!(step = ?e.step(), kind = %e.kind(), "apply failed"),
    }
}

pub async fn destroy(ctx: &Context) -> anyhow::Result<()> {
    let report = ctx.orchestrator()?.destroy().await?;
    info!(env = %report.env, resources = report.resources, "environment destroyed");
    ctx.emit(
        &serde_json::to_value(&report)?,
        &format!("destroyed {} resources in {}", report.resources, report.env),
    )
}

pub fn outputs(ctx: &Context) -> anyhow::Result<()> {
    let outputs = ctx.orchestrator()?.outputs()?;
    let map: serde_json::Map<String, serde_json::Value> =
        outputs.iter().map(|o| (o.key.clone(), json!(o.value))).collect();
    let text = outputs
        .iter()
        .map(|o| format!("{} = {}", o.key, o.value))
        .collect::<Vec<_>>()
        .join("\n");
    ctx.emit(&serde_json::Value::Object(map), &text)
}
