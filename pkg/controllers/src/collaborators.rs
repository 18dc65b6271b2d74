//! Out-of-process collaborators the canary state machine delegates to.
//!
//! The engine only decides *what* should happen (a traffic weight, running
//! a step) and stores whatever the collaborator reports, verbatim, in the
//! Rollout status. How a weight reaches a mesh or how an analysis is run
//! is up to the implementation.

use async_trait::async_trait;
use pkg_types::rollout::{CanaryStep, CollaboratorPhase, CollaboratorStatus, Rollout};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Route `weight` percent of traffic to the canary. `previous` is the
    /// status this router returned last time, if any.
    async fn set_weight(
        &self,
        rollout: &Rollout,
        weight: i32,
        previous: Option<&CollaboratorStatus>,
    ) -> anyhow::Result<CollaboratorStatus>;
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Drive an analysis, experiment or plugin step. Called on every pass
    /// while the step is current, until it reports `Successful` or `Failed`.
    async fn run(
        &self,
        rollout: &Rollout,
        index: i32,
        step: &CanaryStep,
        previous: Option<&CollaboratorStatus>,
    ) -> anyhow::Result<CollaboratorStatus>;
}

/// Router that only logs the weight it was asked to apply.
pub struct LoggingTrafficRouter;

#[async_trait]
impl TrafficRouter for LoggingTrafficRouter {
    async fn set_weight(
        &self,
        rollout: &Rollout,
        weight: i32,
        _previous: Option<&CollaboratorStatus>,
    ) -> anyhow::Result<CollaboratorStatus> {
        info!(
            "Rollout {}: canary traffic weight {}%",
            rollout.metadata.key(),
            weight
        );
        Ok(CollaboratorStatus {
            phase: CollaboratorPhase::Successful,
            message: format!("weight set to {}", weight),
            status: Value::Null,
        })
    }
}

/// Executor that reports every step as successful straight away. The
/// default when no analysis backend is configured.
pub struct PassthroughStepExecutor;

#[async_trait]
impl StepExecutor for PassthroughStepExecutor {
    async fn run(
        &self,
        _rollout: &Rollout,
        _index: i32,
        step: &CanaryStep,
        _previous: Option<&CollaboratorStatus>,
    ) -> anyhow::Result<CollaboratorStatus> {
        Ok(CollaboratorStatus {
            phase: CollaboratorPhase::Successful,
            message: format!("no executor configured for {} step", step.kind()),
            status: Value::Null,
        })
    }
}

/// Registered collaborators, shared by all workers.
#[derive(Clone)]
pub struct Collaborators {
    routers: HashMap<String, Arc<dyn TrafficRouter>>,
    steps: Arc<dyn StepExecutor>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(Arc::new(PassthroughStepExecutor))
    }
}

impl Collaborators {
    pub fn new(steps: Arc<dyn StepExecutor>) -> Self {
        Self {
            routers: HashMap::new(),
            steps,
        }
    }

    pub fn with_router(mut self, name: &str, router: Arc<dyn TrafficRouter>) -> Self {
        self.routers.insert(name.to_string(), router);
        self
    }

    pub fn router(&self, name: &str) -> Option<&Arc<dyn TrafficRouter>> {
        self.routers.get(name)
    }

    pub fn steps(&self) -> &Arc<dyn StepExecutor> {
        &self.steps
    }
}

/// Turn a collaborator call result into a status. Errors never abort the
/// pass; they are recorded with the `Error` phase.
pub fn into_status(result: anyhow::Result<CollaboratorStatus>) -> CollaboratorStatus {
    match result {
        Ok(status) => status,
        Err(e) => CollaboratorStatus {
            phase: CollaboratorPhase::Error,
            message: e.to_string(),
            status: Value::Null,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_become_error_phase() {
        let status = into_status(Err(anyhow::anyhow!("connection refused")));
        assert_eq!(status.phase, CollaboratorPhase::Error);
        assert_eq!(status.message, "connection refused");
    }

    #[test]
    fn routers_are_looked_up_by_name() {
        let c = Collaborators::default().with_router("log", Arc::new(LoggingTrafficRouter));
        assert!(c.router("log").is_some());
        assert!(c.router("istio").is_none());
    }
}
