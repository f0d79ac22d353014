//! Discovery of function kinds from labeled CRDs.
//!
//! A function kind is any CRD labeled as a function schema. The CRD itself
//! carries the dispatcher image and the convergence policy as annotations,
//! so adding a new function kind to a cluster requires no controller change.

use anyhow::{anyhow, bail, Result};
use functions_controller_k8s_api::{
    Api, ApiResource, Client, CustomResourceDefinition, GroupVersionKind, ListParams, CRD_LABEL,
    POLICY_ANNOTATION,
};
use functions_controller_k8s_reconcile::Policy;

/// One reconcilable function kind, as declared by its CRD.
#[derive(Clone, Debug)]
pub(crate) struct FunctionKind {
    pub resource: ApiResource,
    pub plural: String,
    pub crd_name: String,
    pub policy: Policy,
}

/// Lists the function CRDs present in the cluster. A malformed CRD is
/// skipped with a warning rather than failing startup, so one bad schema
/// cannot take down every other kind.
pub(crate) async fn function_kinds(
    client: &Client,
    default_policy: Policy,
) -> Result<Vec<FunctionKind>> {
    let api = Api::<CustomResourceDefinition>::all(client.clone());
    let params = ListParams::default().labels(&format!("{CRD_LABEL}=true"));
    let crds = api.list(&params).await?;

    let mut kinds = Vec::with_capacity(crds.items.len());
    for crd in crds {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match function_kind(&crd, default_policy) {
            Ok(kind) => kinds.push(kind),
            Err(error) => {
                tracing::warn!(crd = %name, %error, "Skipping malformed function CRD")
            }
        }
    }
    Ok(kinds)
}

fn function_kind(
    crd: &CustomResourceDefinition,
    default_policy: Policy,
) -> Result<FunctionKind> {
    let crd_name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("CRD has no name"))?;
    if crd.spec.scope != "Namespaced" {
        bail!("function kinds must be namespaced");
    }

    let version = crd
        .spec
        .versions
        .iter()
        .find(|v| v.served && v.storage)
        .map(|v| v.name.clone())
        .ok_or_else(|| anyhow!("CRD has no served storage version"))?;
    let plural = crd.spec.names.plural.clone();
    let resource = ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(&crd.spec.group, &version, &crd.spec.names.kind),
        &plural,
    );

    let policy = crd
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(POLICY_ANNOTATION))
        .map(|value| value.parse())
        .transpose()?
        .unwrap_or(default_policy);

    Ok(FunctionKind {
        resource,
        plural,
        crd_name,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use functions_controller_k8s_api::IMAGE_ANNOTATION;

    fn crd(policy: Option<&str>) -> CustomResourceDefinition {
        let mut annotations = std::collections::BTreeMap::from([(
            IMAGE_ANNOTATION.to_string(),
            "gcr.io/example/dispatcher".to_string(),
        )]);
        if let Some(policy) = policy {
            annotations.insert(POLICY_ANNOTATION.to_string(), policy.to_string());
        }
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {
                "name": "filters.functions.knative.dev",
                "annotations": annotations,
            },
            "spec": {
                "group": "functions.knative.dev",
                "scope": "Namespaced",
                "names": { "kind": "Filter", "plural": "filters", "singular": "filter" },
                "versions": [
                    { "name": "v1alpha0", "served": false, "storage": false },
                    { "name": "v1alpha1", "served": true, "storage": true },
                ],
            },
        }))
        .unwrap()
    }

    #[test]
    fn resolves_storage_version_and_policy() {
        let kind = function_kind(&crd(Some("routed")), Policy::ExternalName).unwrap();
        assert_eq!(kind.plural, "filters");
        assert_eq!(kind.crd_name, "filters.functions.knative.dev");
        assert_eq!(kind.resource.version, "v1alpha1");
        assert_eq!(kind.policy, Policy::Routed);
    }

    #[test]
    fn falls_back_to_default_policy() {
        let kind = function_kind(&crd(None), Policy::ExternalName).unwrap();
        assert_eq!(kind.policy, Policy::ExternalName);
    }

    #[test]
    fn rejects_cluster_scoped_kinds() {
        let mut cluster_scoped = crd(None);
        cluster_scoped.spec.scope = "Cluster".to_string();
        assert!(function_kind(&cluster_scoped, Policy::ExternalName).is_err());
    }
}
