use pkg_constants::rollout::{MANAGED_BY_ANNOTATION, POD_TEMPLATE_HASH_LABEL, REASON_SWITCH_SERVICE};
use pkg_types::event::EventType;
use pkg_types::service::Service;
use serde_json::json;
use tracing::info;

use crate::client::ClusterClient;
use crate::error::ReconcileError;
use crate::rollout::context::RolloutContext;

impl<C: ClusterClient> RolloutContext<'_, C> {
    pub(crate) async fn get_service(&self, name: &str) -> Result<Service, ReconcileError> {
        match self.client.get_service(self.namespace(), name).await {
            Ok(svc) => Ok(svc),
            Err(e) if e.is_not_found() => Err(ReconcileError::MissingService(format!(
                "{}/{}",
                self.namespace(),
                name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `service` at the pods of `hash`. `service` is replaced with the
    /// patched object. Returns whether the selector changed.
    pub(crate) async fn switch_service_selector(
        &mut self,
        service: &mut Service,
        hash: &str,
    ) -> Result<bool, ReconcileError> {
        let previous = service.selector_value(POD_TEMPLATE_HASH_LABEL).unwrap_or("");
        if previous == hash {
            return Ok(false);
        }
        let message = format!(
            "Switched selector for service {} from '{}' to '{}'",
            service.name(),
            previous,
            hash
        );
        let patch = json!({
            "spec": { "selector": { POD_TEMPLATE_HASH_LABEL: hash } },
            "metadata": { "annotations": { MANAGED_BY_ANNOTATION: self.name() } },
        });
        *service = self
            .client
            .patch_service(self.namespace(), service.name(), &patch)
            .await?;
        info!("Rollout {}: {}", self.key(), message);
        self.record_event(EventType::Normal, REASON_SWITCH_SERVICE, message)
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::testing::{FakeClient, blue_green_rollout, service};
    use pkg_constants::rollout::SERVICE_KIND;

    #[tokio::test]
    async fn switch_patches_selector_and_marks_owner() {
        let client = FakeClient::new();
        let collaborators = Collaborators::default();
        client.add_service(service("active", Some("old")));
        let rollout = blue_green_rollout(2, "active", "");
        let mut ctx = RolloutContext::new(&client, &collaborators, rollout, vec![]);

        let mut svc = ctx.get_service("active").await.unwrap();
        assert!(ctx.switch_service_selector(&mut svc, "new").await.unwrap());
        assert!(!ctx.switch_service_selector(&mut svc, "new").await.unwrap());

        assert_eq!(client.patches(SERVICE_KIND).len(), 1);
        let stored = client.service("active");
        assert_eq!(stored.selector_value(POD_TEMPLATE_HASH_LABEL), Some("new"));
        assert_eq!(stored.selector_value("app"), Some("web"));
        assert_eq!(
            stored.metadata.annotations.get(MANAGED_BY_ANNOTATION),
            Some(&"web".to_string())
        );
    }

    #[tokio::test]
    async fn missing_service_is_reported_by_name() {
        let client = FakeClient::new();
        let collaborators = Collaborators::default();
        let rollout = blue_green_rollout(2, "active", "");
        let ctx = RolloutContext::new(&client, &collaborators, rollout, vec![]);

        let err = ctx.get_service("active").await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingService(name) if name == "default/active"));
    }
}
