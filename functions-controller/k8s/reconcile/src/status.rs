//! Writes the engine-owned status subresource.

use crate::client::KubeCluster;
use functions_controller_core::{Error, Result};
use functions_controller_k8s_api::{Api, DynamicObject, Function, Patch, PatchParams};

#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    /// Persists `function.status` through the status subresource, so a
    /// concurrent spec edit cannot be clobbered and vice versa. The caller is
    /// responsible for checking for semantic differences before calling.
    async fn persist(&self, function: &Function) -> Result<()>;
}

#[async_trait::async_trait]
impl StatusWriter for KubeCluster {
    async fn persist(&self, function: &Function) -> Result<()> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            function.namespace(),
            &self.resource,
        );
        let patch = serde_json::json!({
            "apiVersion": function.api_version,
            "kind": function.kind,
            "status": function.status,
        });
        api.patch_status(function.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::transient)?;
        Ok(())
    }
}
