use anyhow::{Result, bail};

use crate::rollout::{CanaryStep, Rollout, RolloutStrategy};

/// Validate a Kubernetes-style resource name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 63 {
        bail!("name '{}' exceeds 63 characters (got {})", name, name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        bail!("name '{}' must not start or end with a hyphen", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Check a Rollout for errors that no amount of reconciling can fix.
/// The message ends up in the `InvalidSpec` condition.
pub fn validate_rollout(rollout: &Rollout) -> Result<()> {
    validate_name(&rollout.metadata.name)?;
    let spec = &rollout.spec;
    if let Some(replicas) = spec.replicas
        && replicas < 0
    {
        bail!("spec.replicas must be >= 0 (got {})", replicas);
    }
    if spec.template.spec.containers.is_empty() {
        bail!("spec.template must define at least one container");
    }
    for (k, v) in &spec.selector {
        if spec.template.metadata.labels.get(k) != Some(v) {
            bail!(
                "spec.selector {}={} does not match the template labels",
                k,
                v
            );
        }
    }

    match &spec.strategy {
        RolloutStrategy::Canary(canary) => {
            let replicas = rollout.replicas();
            let max_surge = canary.max_surge_or_default().scaled_value(replicas, true)?;
            if max_surge < 0 {
                bail!("canary.maxSurge must not be negative (got {})", max_surge);
            }
            let max_unavailable = canary
                .max_unavailable_or_default()
                .scaled_value(replicas, false)?;
            if max_unavailable < 0 {
                bail!(
                    "canary.maxUnavailable must not be negative (got {})",
                    max_unavailable
                );
            }
            for (i, step) in canary.steps.iter().enumerate() {
                match step {
                    CanaryStep::SetWeight(w) if !(0..=100).contains(w) => {
                        bail!("steps[{}].setWeight must be within 0..=100 (got {})", i, w);
                    }
                    CanaryStep::Pause(pause) => {
                        if let Err(e) = pause.duration() {
                            bail!("steps[{}].pause: {}", i, e);
                        }
                    }
                    CanaryStep::Plugin(plugin) if plugin.name.is_empty() => {
                        bail!("steps[{}].plugin.name must not be empty", i);
                    }
                    _ => {}
                }
            }
        }
        RolloutStrategy::BlueGreen(bg) => {
            if bg.active_service.is_empty() {
                bail!("blueGreen.activeService must not be empty");
            }
            if bg.preview_service() == Some(bg.active_service.as_str()) {
                bail!("blueGreen.previewService must differ from activeService");
            }
        }
    }
    Ok(())
}
