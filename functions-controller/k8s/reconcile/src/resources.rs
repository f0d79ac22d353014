//! Desired-state descriptors for child resources.
//!
//! Child names derive purely from the function kind, namespace, and parent
//! name, so repeated reconciliation is idempotent at the naming layer before
//! any diffing happens.

use crate::sync::{ChildSpec, OwnerHandle};
use functions_controller_k8s_api::{
    self as k8s, serving, ObjectMeta, ServicePort, ROLE_DISPATCHER, ROLE_LABEL,
};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Container, Volume, VolumeMount};
use std::collections::BTreeMap;

/// The dispatcher configuration document inside the per-kind config map.
pub const CONFIG_KEY: &str = "___config.json";
const CONFIG_MOUNT_PATH: &str = "/ko-app/___config.json";

/// Annotation tying a dispatcher revision to the config-map version it was
/// rolled out with.
pub const CONFIG_VERSION_ANNOTATION: &str = "functions.knative.dev/cm-resourceVersion";

pub fn service_name(function_name: &str) -> String {
    format!("{function_name}-svc-function")
}

pub fn route_name(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}-{namespace}-{name}")
}

pub fn dispatcher_config_name(kind: &str) -> String {
    format!("config-function-{kind}")
}

pub fn language_config_name(kind: &str, language: &str) -> String {
    format!("{kind}-{language}")
}

pub fn configuration_name(kind: &str, language: &str) -> String {
    format!("{kind}-dispatcher-{language}")
}

pub fn cluster_address(name: &str, namespace: &str, domain: &str) -> String {
    format!("{name}.{namespace}.svc.{domain}")
}

fn role_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(ROLE_LABEL.to_string(), ROLE_DISPATCHER.to_string())])
}

fn child_meta(namespace: &str, name: &str, owner: &OwnerHandle) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        labels: Some(role_labels()),
        owner_references: Some(vec![owner.controller_ref()]),
        ..Default::default()
    }
}

/// An ExternalName service in the function's namespace, pointing at the
/// shared dispatcher for the function's language.
#[derive(Clone, Debug)]
pub struct ExternalService {
    pub namespace: String,
    pub name: String,
    pub external_name: String,
}

impl ChildSpec for ExternalService {
    type Object = k8s::Service;

    const KIND: &'static str = "Service";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, owner: &OwnerHandle) -> k8s::Service {
        k8s::Service {
            metadata: child_meta(&self.namespace, &self.name, owner),
            spec: Some(k8s::ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some(self.external_name.clone()),
                ports: Some(vec![ServicePort {
                    name: Some("endpoint".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn overlay(&self, actual: &k8s::Service) -> Option<k8s::Service> {
        let current = actual.spec.as_ref();
        if current.and_then(|s| s.type_.as_deref()) == Some("ExternalName")
            && current.and_then(|s| s.external_name.as_deref()) == Some(&self.external_name)
        {
            return None;
        }
        let mut updated = actual.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.type_ = Some("ExternalName".to_string());
        spec.external_name = Some(self.external_name.clone());
        Some(updated)
    }
}

/// Managed entries of a dispatcher config map. Entries outside `entries` are
/// never touched. With `insert_only` set, an existing key is left alone even
/// when its value differs -- used to seed the baseline document without
/// clobbering accumulated configuration.
#[derive(Clone, Debug)]
pub struct FunctionConfig {
    pub namespace: String,
    pub name: String,
    pub entries: BTreeMap<String, String>,
    pub insert_only: bool,
}

impl ChildSpec for FunctionConfig {
    type Object = k8s::ConfigMap;

    const KIND: &'static str = "ConfigMap";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, owner: &OwnerHandle) -> k8s::ConfigMap {
        k8s::ConfigMap {
            metadata: child_meta(&self.namespace, &self.name, owner),
            data: Some(self.entries.clone()),
            ..Default::default()
        }
    }

    fn overlay(&self, actual: &k8s::ConfigMap) -> Option<k8s::ConfigMap> {
        let current = actual.data.clone().unwrap_or_default();
        let stale = self.entries.iter().any(|(key, value)| match current.get(key) {
            None => true,
            Some(existing) => !self.insert_only && existing != value,
        });
        if !stale {
            return None;
        }
        let mut updated = actual.clone();
        let data = updated.data.get_or_insert_with(Default::default);
        for (key, value) in &self.entries {
            if !data.contains_key(key) || !self.insert_only {
                data.insert(key.clone(), value.clone());
            }
        }
        Some(updated)
    }
}

/// The per-function route onto the dispatcher configuration.
#[derive(Clone, Debug)]
pub struct FunctionRoute {
    pub namespace: String,
    pub name: String,
    pub configuration: String,
}

impl FunctionRoute {
    fn traffic(&self) -> Vec<serving::TrafficTarget> {
        vec![serving::TrafficTarget {
            configuration_name: Some(self.configuration.clone()),
            latest_revision: Some(true),
            percent: 100,
        }]
    }
}

impl ChildSpec for FunctionRoute {
    type Object = serving::Route;

    const KIND: &'static str = "Route";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, owner: &OwnerHandle) -> serving::Route {
        let mut route = serving::Route::new(&self.name, serving::RouteSpec { traffic: self.traffic() });
        route.metadata = child_meta(&self.namespace, &self.name, owner);
        route
    }

    fn overlay(&self, actual: &serving::Route) -> Option<serving::Route> {
        if actual.spec.traffic == self.traffic() {
            return None;
        }
        let mut updated = actual.clone();
        updated.spec.traffic = self.traffic();
        Some(updated)
    }
}

/// The shared, per-kind dispatcher service running the function image with
/// the config map mounted.
#[derive(Clone, Debug)]
pub struct DispatcherService {
    pub namespace: String,
    pub kind: String,
    pub image: String,
    pub config_version: String,
}

impl DispatcherService {
    fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            CONFIG_VERSION_ANNOTATION.to_string(),
            self.config_version.clone(),
        )])
    }
}

impl ChildSpec for DispatcherService {
    type Object = serving::Service;

    const KIND: &'static str = "Service.serving";

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.kind
    }

    fn build(&self, owner: &OwnerHandle) -> serving::Service {
        let config_name = dispatcher_config_name(&self.kind);
        let mut service = serving::Service::new(
            &self.kind,
            serving::ServiceSpec {
                template: serving::RevisionTemplate {
                    metadata: Some(ObjectMeta {
                        annotations: Some(self.annotations()),
                        ..Default::default()
                    }),
                    spec: serving::RevisionSpec {
                        containers: vec![Container {
                            name: "dispatcher".to_string(),
                            image: Some(self.image.clone()),
                            volume_mounts: Some(vec![VolumeMount {
                                name: config_name.clone(),
                                mount_path: CONFIG_MOUNT_PATH.to_string(),
                                sub_path: Some(CONFIG_KEY.to_string()),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: config_name.clone(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(config_name),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                    },
                },
            },
        );
        service.metadata = child_meta(&self.namespace, &self.kind, owner);
        service
    }

    /// Only the revision-template annotations are managed on an existing
    /// dispatcher: changing them rolls out a new revision picking up the
    /// latest configuration.
    fn overlay(&self, actual: &serving::Service) -> Option<serving::Service> {
        let desired = self.annotations();
        let current = actual
            .spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.annotations.as_ref());
        if current == Some(&desired) {
            return None;
        }
        let mut updated = actual.clone();
        updated
            .spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations = Some(desired);
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        assert_eq!(service_name("fn-a"), "fn-a-svc-function");
        assert_eq!(route_name("filters", "ns", "fn-a"), "filters-ns-fn-a");
        assert_eq!(dispatcher_config_name("filters"), "config-function-filters");
        assert_eq!(language_config_name("filters", "js"), "filters-js");
        assert_eq!(configuration_name("filters", "js"), "filters-dispatcher-js");
        assert_eq!(
            cluster_address("fn-a-svc-function", "ns", "cluster.local"),
            "fn-a-svc-function.ns.svc.cluster.local",
        );
    }

    #[test]
    fn config_overlay_touches_only_managed_keys() {
        let spec = FunctionConfig {
            namespace: "sys".to_string(),
            name: "config-function-filters".to_string(),
            entries: BTreeMap::from([("fn-a.ns".to_string(), "{}".to_string())]),
            insert_only: false,
        };
        let actual = k8s::ConfigMap {
            data: Some(BTreeMap::from([
                ("fn-a.ns".to_string(), "old".to_string()),
                ("unrelated".to_string(), "kept".to_string()),
            ])),
            ..Default::default()
        };

        let updated = spec.overlay(&actual).expect("entry differs");
        let data = updated.data.unwrap();
        assert_eq!(data.get("fn-a.ns").map(String::as_str), Some("{}"));
        assert_eq!(data.get("unrelated").map(String::as_str), Some("kept"));
    }

    #[test]
    fn insert_only_config_never_clobbers() {
        let spec = FunctionConfig {
            namespace: "sys".to_string(),
            name: "config-function-filters".to_string(),
            entries: BTreeMap::from([(CONFIG_KEY.to_string(), "{}".to_string())]),
            insert_only: true,
        };

        let empty = k8s::ConfigMap::default();
        assert!(spec.overlay(&empty).is_some(), "baseline must be seeded");

        let populated = k8s::ConfigMap {
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                r#"{"host":{}}"#.to_string(),
            )])),
            ..Default::default()
        };
        assert!(spec.overlay(&populated).is_none());
    }

    #[test]
    fn external_service_overlay_is_stable() {
        let spec = ExternalService {
            namespace: "ns".to_string(),
            name: "fn-a-svc-function".to_string(),
            external_name: "filters-js.sys.svc.cluster.local".to_string(),
        };
        let owner = OwnerHandle {
            api_version: "functions.knative.dev/v1alpha1".to_string(),
            kind: "Filter".to_string(),
            name: "fn-a".to_string(),
            uid: "uid-1".to_string(),
        };
        let built = spec.build(&owner);
        assert!(spec.overlay(&built).is_none());
        assert_eq!(
            built.metadata.owner_references.as_ref().unwrap()[0].controller,
            Some(true),
        );
    }
}
