use anyhow::bail;
use edgechain_core::StackConfig;
use edgechain_provision::Action;
use serde_json::json;
use tracing::info;

use super::Context;

pub fn init(ctx: &Context, name: &str, region: &str, image: &str, certificate: &str, force: bool) -> anyhow::Result<()> {
    if ctx.config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", ctx.config.display());
    }
    let config = StackConfig::scaffold(name, region, image, certificate);
    config.validate()?;
    std::fs::write(&ctx.config, config.to_toml_string()?)?;
    info!(path = %ctx.config.display(), stack = name, "config written");
    ctx.emit(
        &json!({ "config": ctx.config.display().to_string() }),
        &format!("wrote {}", ctx.config.display()),
    )
}

/// Build every step against the recorded state. Nothing is provisioned.
pub fn validate(ctx: &Context) -> anyhow::Result<()> {
    let orchestrator = ctx.orchestrator()?;
    let (resources, deployment) = orchestrator.build()?;
    let chain = deployment.port_chain;
    let plan = orchestrator.plan()?;
    ctx.emit(
        &json!({
            "valid": true,
            "resources": resources.len(),
            "port_chain": chain,
            "pending": plan.pending().count(),
        }),
        &format!(
            "config is valid: {} resources, ports {} -> {} -> {}, {} to create",
            resources.len(),
            chain.external_port,
            chain.internal_port,
            chain.container_port,
            plan.count(Action::Create),
        ),
    )
}
