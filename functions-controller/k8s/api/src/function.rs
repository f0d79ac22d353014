use functions_controller_core::{Condition, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::ObjectMeta,
    core::{ApiResource, DynamicObject},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed view over a dynamically-discovered function instance.
///
/// Function kinds are ordinary CRDs discovered at runtime, so instances
/// arrive as `DynamicObject`s. The spec remains an opaque JSON map beyond the
/// named fields the engine reads; the status is fully engine-owned.
#[derive(Clone, Debug)]
pub struct Function {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: Map<String, Value>,
    pub status: FunctionStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Addressable {
    pub url: String,
}

// Condition lists are compared as sets keyed by type: the engine appends in a
// deterministic order, but a status written by an earlier build must still
// compare equal.
impl PartialEq for FunctionStatus {
    fn eq(&self, other: &Self) -> bool {
        self.observed_generation == other.observed_generation
            && self.address == other.address
            && self.url == other.url
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .all(|c| other.conditions.iter().any(|o| o == c))
    }
}

impl Eq for FunctionStatus {}

impl Function {
    /// Builds the typed view from a watched object. The `ApiResource` is
    /// authoritative for the kind, since objects observed through a watch may
    /// be missing type metadata.
    pub fn from_dynamic(obj: DynamicObject, resource: &ApiResource) -> Self {
        let spec = obj
            .data
            .get("spec")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let status = obj
            .data
            .get("status")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();
        Self {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
            metadata: obj.metadata,
            spec,
            status,
        }
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }
}

/// The validated view of the spec fields the engine reads.
///
/// Constructed once at the top of reconciliation; a missing or mistyped field
/// is a terminal configuration error rather than a scattered type assertion.
#[derive(Clone, Debug)]
pub struct FunctionView {
    pub language: String,
}

impl TryFrom<&Function> for FunctionView {
    type Error = Error;

    fn try_from(function: &Function) -> Result<Self> {
        let language = function
            .spec
            .get("language")
            .ok_or_else(|| Error::Config("spec is missing the `language` field".to_string()))?
            .as_str()
            .ok_or_else(|| Error::Config("spec field `language` must be a string".to_string()))?
            .to_string();
        Ok(Self { language })
    }
}

/// Returns the controlling owner reference, if any.
pub fn controller_of(metadata: &ObjectMeta) -> Option<&OwnerReference> {
    metadata
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use functions_controller_core::ConditionStatus;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn test_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("functions.knative.dev", "v1alpha1", "Filter"),
            "filters",
        )
    }

    #[test]
    fn view_requires_language() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "functions.knative.dev/v1alpha1",
            "kind": "Filter",
            "metadata": { "namespace": "ns", "name": "fn" },
            "spec": { "predicate": "x > 1" },
        }))
        .unwrap();
        let function = Function::from_dynamic(obj, &test_resource());
        assert!(matches!(
            FunctionView::try_from(&function),
            Err(Error::Config(_)),
        ));
    }

    #[test]
    fn view_rejects_mistyped_language() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "functions.knative.dev/v1alpha1",
            "kind": "Filter",
            "metadata": { "namespace": "ns", "name": "fn" },
            "spec": { "language": 7 },
        }))
        .unwrap();
        let function = Function::from_dynamic(obj, &test_resource());
        assert!(matches!(
            FunctionView::try_from(&function),
            Err(Error::Config(_)),
        ));
    }

    #[test]
    fn status_equality_ignores_condition_order() {
        let synced = Condition {
            type_: "ConfigMapSynced".to_string(),
            status: ConditionStatus::True,
            reason: None,
            message: None,
            last_transition_time: None,
        };
        let ready = Condition {
            type_: "Ready".to_string(),
            status: ConditionStatus::True,
            reason: None,
            message: None,
            last_transition_time: None,
        };

        let a = FunctionStatus {
            conditions: vec![synced.clone(), ready.clone()],
            ..Default::default()
        };
        let b = FunctionStatus {
            conditions: vec![ready, synced],
            ..Default::default()
        };
        assert_eq!(a, b);
    }
}
